//! Takes its time answering.

use std::time::Duration;

use crossbit::{Call, Fault, Handler, HandlerContext, Library, MemberTable, Value};

pub struct Sleeper {
    library: Library,
}

impl Handler for Sleeper {
    fn construct(ctx: &HandlerContext) -> Result<Self, Fault> {
        Ok(Self {
            library: super::bind_default(ctx)?,
        })
    }

    fn library(&self) -> Option<&Library> {
        Some(&self.library)
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new().method("sleep", |_: &mut Self, call: Call| {
            let seconds: f64 = call.arg(0)?;
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(Fault::value_error(format!(
                    "sleep length must be a non-negative number, got {seconds}"
                )));
            }
            std::thread::sleep(Duration::from_secs_f64(seconds));
            Ok(Value::Float(seconds))
        })
    }
}
