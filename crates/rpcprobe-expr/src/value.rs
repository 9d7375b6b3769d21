use crate::{error::Capability, token::Literal};
use core::fmt;

/// Which half of an exchange a handle points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Request,
    Response,
}

impl Side {
    pub const fn name(self) -> &'static str {
        match self {
            Side::Request => "request",
            Side::Response => "response",
        }
    }
}

/// Lazy reference into the context. Nothing is read from the context until
/// an attribute is taken off the handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handle {
    /// `$env`
    Env,
    /// `$res` / `$req`
    Message(Side),
    /// `$res.$body`
    Body(Side),
    /// `$res.$header`
    Headers(Side),
}

/// Dynamically typed result of an evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// JSON object or array. Scalars are converted to native variants.
    Json(serde_json::Value),
    Handle(Handle),
}

impl Value {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Json(serde_json::Value::Array(_)) => "array",
            Value::Json(_) => "object",
            Value::Handle(Handle::Env) => "$env",
            Value::Handle(Handle::Message(Side::Request)) => "$req",
            Value::Handle(Handle::Message(Side::Response)) => "$res",
            Value::Handle(Handle::Body(_)) => "$body",
            Value::Handle(Handle::Headers(_)) => "$header",
        }
    }

    /// Whether a dot (`Get`) or an assignment through a dot (`Set`) can be
    /// applied to this value.
    pub const fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Get => matches!(self, Value::Handle(_) | Value::Json(_)),
            Capability::Set => matches!(self, Value::Handle(Handle::Env)),
        }
    }

    /// Converts parsed JSON, unwrapping scalars.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            serde_json::Value::String(s) => Value::Str(s),
            other => Value::Json(other),
        }
    }

    /// Converts back into JSON. Handles have no JSON form and become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Handle(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Json(json) => json.clone(),
        }
    }

    /// String form used by `@contain` and by template substitution.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            other => other.to_string(),
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Json(json) => write!(f, "{json}"),
            Value::Handle(_) => f.write_str(self.type_name()),
        }
    }
}

impl From<Literal> for Value {
    fn from(literal: Literal) -> Self {
        match literal {
            Literal::Int(i) => Value::Int(i),
            Literal::Float(f) => Value::Float(f),
            Literal::Str(s) => Value::Str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_scalars_become_native() {
        assert_eq!(Value::from_json(json!(null)), Value::Null);
        assert_eq!(Value::from_json(json!(true)), Value::Bool(true));
        assert_eq!(Value::from_json(json!(7)), Value::Int(7));
        assert_eq!(Value::from_json(json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from_json(json!("x")), Value::from("x"));
        assert_eq!(
            Value::from_json(json!({"a": 1})),
            Value::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn capabilities() {
        assert!(Value::Handle(Handle::Env).supports(Capability::Set));
        assert!(Value::Handle(Handle::Env).supports(Capability::Get));
        assert!(!Value::Handle(Handle::Message(Side::Response)).supports(Capability::Set));
        assert!(Value::Json(json!({})).supports(Capability::Get));
        assert!(!Value::Json(json!({})).supports(Capability::Set));
        assert!(!Value::from("x").supports(Capability::Get));
        assert!(!Value::Int(1).supports(Capability::Get));
    }

    #[test]
    fn text_forms() {
        assert_eq!(Value::Int(3).to_text(), "3");
        assert_eq!(Value::Bool(false).to_text(), "false");
        assert_eq!(Value::Bytes(b"ok".to_vec()).to_text(), "ok");
        assert_eq!(Value::Json(json!({"a":"b"})).to_text(), r#"{"a":"b"}"#);
        assert_eq!(Value::Handle(Handle::Body(Side::Request)).to_text(), "$body");
    }

    #[test]
    fn json_round_trip_of_scalars() {
        assert_eq!(Value::Int(5).to_json(), json!(5));
        assert_eq!(Value::from("t").to_json(), json!("t"));
        assert_eq!(Value::Handle(Handle::Env).to_json(), json!(null));
    }
}
