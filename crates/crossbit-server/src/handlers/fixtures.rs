//! Handlers that misbehave while being constructed.

use std::time::Duration;

use crossbit::{Fault, Handler, HandlerContext, Library, MemberTable};

/// Never finishes construction.
pub struct HangOnConstruct;

impl Handler for HangOnConstruct {
    fn construct(_: &HandlerContext) -> Result<Self, Fault> {
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    fn library(&self) -> Option<&Library> {
        None
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
    }
}

/// Requires a numeric `scale` kwarg.
pub struct FailOnConstruct {
    library: Library,
}

impl Handler for FailOnConstruct {
    fn construct(ctx: &HandlerContext) -> Result<Self, Fault> {
        let raw = ctx.kwarg("scale").unwrap_or_default();
        if raw.parse::<f64>().is_err() {
            return Err(Fault::type_error(format!(
                "FailOnConstruct() expects a numeric 'scale', got '{raw}'"
            )));
        }
        Ok(Self {
            library: super::bind_default(ctx)?,
        })
    }

    fn library(&self) -> Option<&Library> {
        Some(&self.library)
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
    }
}

pub struct PanicOnConstruct;

impl Handler for PanicOnConstruct {
    fn construct(_: &HandlerContext) -> Result<Self, Fault> {
        panic!("the library could not be initialised")
    }

    fn library(&self) -> Option<&Library> {
        None
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
    }
}

/// Constructs but never binds a library.
pub struct Unbound;

impl Handler for Unbound {
    fn construct(_: &HandlerContext) -> Result<Self, Fault> {
        Ok(Self)
    }

    fn library(&self) -> Option<&Library> {
        None
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
    }
}
