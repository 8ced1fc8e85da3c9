//! Arithmetic on whatever numbers the controller sends.

use crossbit::{Call, Fault, Handler, HandlerContext, Library, MemberTable, Value};

pub struct Calculator {
    library: Library,
    calls: i64,
}

impl Calculator {
    fn binary(&mut self, call: &Call, op: &str) -> Result<(Value, Value), Fault> {
        self.calls += 1;
        call.expect_at_most(2)?;
        let a: Value = call.arg(0)?;
        let b: Value = call.arg(1)?;
        if a.as_f64().is_none() || b.as_f64().is_none() {
            return Err(Fault::type_error(format!(
                "unsupported operand type(s) for {op}: '{}' and '{}'",
                a.type_name(),
                b.type_name()
            )));
        }
        Ok((a, b))
    }
}

/// Integer when both sides are integers, float otherwise.
fn arithmetic(
    a: &Value,
    b: &Value,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value, Fault> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int(*x, *y)
            .map(Value::Int)
            .ok_or_else(|| Fault::new("OverflowError", "integer overflow")),
        _ => {
            let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            Ok(Value::Float(float(x, y)))
        }
    }
}

impl Handler for Calculator {
    fn construct(ctx: &HandlerContext) -> Result<Self, Fault> {
        Ok(Self {
            library: super::bind_default(ctx)?,
            calls: 0,
        })
    }

    fn library(&self) -> Option<&Library> {
        Some(&self.library)
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
            .method("add", |this: &mut Self, call: Call| {
                let (a, b) = this.binary(&call, "+")?;
                arithmetic(&a, &b, i64::checked_add, |x, y| x + y)
            })
            .method("subtract", |this: &mut Self, call: Call| {
                let (a, b) = this.binary(&call, "-")?;
                arithmetic(&a, &b, i64::checked_sub, |x, y| x - y)
            })
            .method("divide", |this: &mut Self, call: Call| {
                let (a, b) = this.binary(&call, "/")?;
                if b.as_f64() == Some(0.0) {
                    return Err(Fault::new("ZeroDivisionError", "division by zero"));
                }
                let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
                Ok(Value::Float(x / y))
            })
            .method("parse_int", |_: &mut Self, call: Call| {
                let text: String = call.arg(0)?;
                let n: i64 = text.trim().parse()?;
                Ok(Value::Int(n))
            })
            .property("calls", |this: &Self| Ok(Value::Int(this.calls)))
            .attribute("pi", std::f64::consts::PI)
    }

    fn shutdown_handler(&mut self) {
        tracing::info!(calls = self.calls, "Calculator shutting down");
    }
}
