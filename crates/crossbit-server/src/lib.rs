//! Handler modules built into the crossbit-server binary.

pub mod handlers;

use crossbit::HandlerRegistry;

use handlers::{calculator, echo, fixtures, sleeper};

/// Every module this worker can host.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register::<echo::Echo>("echo")
        .register::<calculator::Calculator>("calculator")
        .register::<sleeper::Sleeper>("sleeper")
        .register::<fixtures::HangOnConstruct>("hang_on_construct")
        .register::<fixtures::FailOnConstruct>("fail_on_construct")
        .register::<fixtures::PanicOnConstruct>("panic_on_construct")
        .register::<fixtures::Unbound>("unbound")
        .declare("no_handler");
    registry
}
