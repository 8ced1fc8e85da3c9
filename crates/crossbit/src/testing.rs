//! Handlers shared by unit tests.

use std::time::Duration;

use crate::bridge::protocol::Fault;
use crate::handler::{Handler, HandlerContext, HandlerRegistry, LibType, Library, MemberTable};
use crate::value::{Call, Value};

/// Binds the test binary itself and counts calls.
pub struct Counter {
    library: Library,
    calls: i64,
    pub label: String,
}

impl Handler for Counter {
    fn construct(ctx: &HandlerContext) -> Result<Self, Fault> {
        let exe = std::env::current_exe()?;
        Ok(Self {
            library: Library::bind(ctx, exe, LibType::Cdll)?,
            calls: 0,
            label: ctx.kwarg("label").unwrap_or("counter").to_string(),
        })
    }

    fn library(&self) -> Option<&Library> {
        Some(&self.library)
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
            .method("add", |this: &mut Self, call: Call| {
                this.calls += 1;
                let a: i64 = call.arg(0)?;
                let b: i64 = call.arg(1)?;
                Ok(Value::Int(a + b))
            })
            .method("echo", |_: &mut Self, call: Call| {
                Ok(Value::List(vec![
                    Value::List(call.args),
                    Value::Map(call.kwargs),
                ]))
            })
            .method("nap", |_: &mut Self, call: Call| {
                let millis: i64 = call.arg(0)?;
                std::thread::sleep(Duration::from_millis(millis.max(0) as u64));
                Ok(Value::None)
            })
            .method("explode", |_: &mut Self, _: Call| panic!("counter exploded"))
            .property("calls", |this: &Self| Ok(Value::Int(this.calls)))
            .property("label", |this: &Self| Ok(Value::from(this.label.as_str())))
            .attribute("unit", "counts")
    }
}

/// A handler that constructs but never binds a library.
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

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register::<Counter>("counter")
        .register::<Unbound>("unbound")
        .declare("empty");
    registry
}
