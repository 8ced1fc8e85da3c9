//! Dynamic values carried across the process boundary.
//!
//! Call arguments, keyword arguments and return values all travel as [`Value`]
//! and keep their full type through the bulk-data channel. Constructor kwargs
//! on the launch line do not: they are stringified with [`Value`]'s `Display`.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::Fault;

/// Keyword arguments of a call.
pub type Kwargs = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex {
        re: f64,
        im: f64,
    },
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(data.into())
    }

    pub fn complex(re: f64, im: f64) -> Self {
        Self::Complex { re, im }
    }

    /// Short type name used in `TypeError` messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Complex { .. } => "complex",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    fn write_repr(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "'{}'", s.escape_default()),
            other => write!(f, "{other}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write_float(f, *v),
            Self::Complex { re, im } => {
                if *im < 0.0 {
                    write!(f, "({re}-{}j)", -im)
                } else {
                    write!(f, "({re}+{im}j)")
                }
            }
            Self::Str(s) => f.write_str(s),
            Self::Bytes(data) => write!(f, "b'{}'", data.escape_ascii()),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.write_repr(f)?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{}': ", key.escape_default())?;
                    value.write_repr(f)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// `2.0` keeps its fraction so it cannot be mistaken for an int.
fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        f.write_str("nan")
    } else if v.is_infinite() {
        f.write_str(if v > 0.0 { "inf" } else { "-inf" })
    } else {
        write!(f, "{v:?}")
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::None
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Self::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or_default()
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Typed extraction of a call argument.
pub trait FromValue: Sized {
    /// Type name reported when extraction fails.
    const EXPECTED: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    const EXPECTED: &'static str = "any";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for bool {
    const EXPECTED: &'static str = "bool";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "int";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "float";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "str";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for Vec<Value> {
    const EXPECTED: &'static str = "list";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_list().map(<[Value]>::to_vec)
    }
}

impl FromValue for Vec<u8> {
    const EXPECTED: &'static str = "bytes";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(data) => Some(data.clone()),
            _ => None,
        }
    }
}

impl FromValue for BTreeMap<String, Value> {
    const EXPECTED: &'static str = "map";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_map().cloned()
    }
}

/// A request: positional and keyword arguments for one member.
///
/// The member name itself travels in the control-channel path, so only the
/// arguments are written to the bulk-data channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl Call {
    pub fn new(args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Kwargs::new(),
        }
    }

    /// Extract positional argument `index`, raising `TypeError` when it is
    /// missing or has the wrong type.
    #[track_caller]
    pub fn arg<T: FromValue>(&self, index: usize) -> Result<T, Fault> {
        let caller = Location::caller();
        let Some(value) = self.args.get(index) else {
            return Err(Fault::at(
                Fault::TYPE_ERROR,
                format!(
                    "missing required positional argument {index} (got {} argument(s))",
                    self.args.len()
                ),
                caller,
            ));
        };
        match T::from_value(value) {
            Some(v) => Ok(v),
            None => Err(Fault::at(
                Fault::TYPE_ERROR,
                format!(
                    "argument {index} must be {}, not {}",
                    T::EXPECTED,
                    value.type_name()
                ),
                caller,
            )),
        }
    }

    /// Extract an optional keyword argument.
    #[track_caller]
    pub fn kwarg<T: FromValue>(&self, key: &str) -> Result<Option<T>, Fault> {
        let caller = Location::caller();
        let Some(value) = self.kwargs.get(key) else {
            return Ok(None);
        };
        match T::from_value(value) {
            Some(v) => Ok(Some(v)),
            None => Err(Fault::at(
                Fault::TYPE_ERROR,
                format!(
                    "keyword argument '{key}' must be {}, not {}",
                    T::EXPECTED,
                    value.type_name()
                ),
                caller,
            )),
        }
    }

    /// Reject calls with more positional arguments than `max`.
    #[track_caller]
    pub fn expect_at_most(&self, max: usize) -> Result<(), Fault> {
        if self.args.len() > max {
            return Err(Fault::at(
                Fault::TYPE_ERROR,
                format!(
                    "takes {max} positional argument(s) but {} were given",
                    self.args.len()
                ),
                Location::caller(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn display_matches_launch_line_stringification() {
        assert_eq!(Value::from(100).to_string(), "100");
        assert_eq!(Value::from(3.14).to_string(), "3.14");
        assert_eq!(Value::from("filename.csv").to_string(), "filename.csv");
        assert_eq!(Value::from(true).to_string(), "true");
        assert_eq!(Value::None.to_string(), "None");
        assert_eq!(Value::complex(0.0, 7.0).to_string(), "(0+7j)");
        assert_eq!(
            Value::List(vec![1.into(), "hey".into()]).to_string(),
            "[1, 'hey']"
        );
    }

    #[test]
    fn whole_floats_keep_their_fraction() {
        assert_eq!(Value::from(2.0).to_string(), "2.0");
        assert_eq!(Value::from(-0.5).to_string(), "-0.5");
        assert_eq!(Value::from(f64::INFINITY).to_string(), "inf");
        assert_eq!(Value::from(f64::NAN).to_string(), "nan");
        assert_eq!(
            Value::List(vec![Value::from(2.0), Value::from(2)]).to_string(),
            "[2.0, 2]"
        );
    }

    #[test]
    fn from_json_prefers_integers() {
        let v = Value::from(json!({"a": [1, 2.5, "x", null, true]}));
        let map = v.as_map().unwrap();
        assert_eq!(
            map["a"],
            Value::List(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Str("x".into()),
                Value::None,
                Value::Bool(true),
            ])
        );
    }

    #[test]
    fn arg_extracts_typed_values() {
        let call = Call::positional(vec![2.into(), 1.5.into(), "s".into()]);
        assert_eq!(call.arg::<i64>(0).unwrap(), 2);
        assert_eq!(call.arg::<f64>(0).unwrap(), 2.0);
        assert_eq!(call.arg::<f64>(1).unwrap(), 1.5);
        assert_eq!(call.arg::<String>(2).unwrap(), "s");
    }

    #[test]
    fn arg_type_mismatch_is_type_error() {
        let call = Call::positional(vec![2.into(), "x".into()]);
        let fault = call.arg::<i64>(1).unwrap_err();
        assert_eq!(fault.name, Fault::TYPE_ERROR);
        assert_eq!(fault.message, "argument 1 must be int, not str");
        assert!(fault.trace.contains("value.rs"));
    }

    #[test]
    fn missing_arg_is_type_error() {
        let call = Call::default();
        let fault = call.arg::<Value>(0).unwrap_err();
        assert_eq!(fault.name, Fault::TYPE_ERROR);
        assert!(fault.message.contains("missing required positional argument 0"));
    }

    #[test]
    fn kwarg_is_optional() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("scale".into(), 3.into());
        let call = Call::new(vec![], kwargs);
        assert_eq!(call.kwarg::<i64>("scale").unwrap(), Some(3));
        assert_eq!(call.kwarg::<i64>("offset").unwrap(), None);
        assert!(call.kwarg::<String>("scale").is_err());
    }

    #[test]
    fn expect_at_most_rejects_extra_arguments() {
        let call = Call::positional(vec![1.into(), 2.into(), 3.into()]);
        assert!(call.expect_at_most(3).is_ok());
        let fault = call.expect_at_most(2).unwrap_err();
        assert_eq!(fault.message, "takes 2 positional argument(s) but 3 were given");
    }
}
