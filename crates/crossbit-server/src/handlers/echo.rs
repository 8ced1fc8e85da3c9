//! Sends back whatever it receives.

use std::collections::BTreeMap;

use crossbit::{Call, Fault, Handler, HandlerContext, Library, MemberTable, Value};

pub struct Echo {
    library: Library,
    kwargs: BTreeMap<String, String>,
}

impl Handler for Echo {
    fn construct(ctx: &HandlerContext) -> Result<Self, Fault> {
        Ok(Self {
            library: super::bind_default(ctx)?,
            kwargs: ctx.kwargs().clone(),
        })
    }

    fn library(&self) -> Option<&Library> {
        Some(&self.library)
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
            .method("received_data", |_: &mut Self, call: Call| {
                Ok(Value::List(vec![
                    Value::List(call.args),
                    Value::Map(call.kwargs),
                ]))
            })
            .method("send_data", |_: &mut Self, call: Call| {
                call.expect_at_most(1)?;
                call.arg::<Value>(0)
            })
            .property("kwargs", |this: &Self| {
                Ok(Value::Map(
                    this.kwargs
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                ))
            })
    }
}
