use crate::value::Value;
use std::collections::HashMap;

/// One side of a call as seen by expressions.
pub trait Message {
    fn body(&self) -> &[u8];

    /// Header lookup. Implementations match `name` case-insensitively.
    fn header(&self, name: &str) -> Option<String>;
}

/// Capabilities the evaluator needs from its host.
///
/// The evaluator holds no state of its own; `set_env` is the only way an
/// expression has side effects.
pub trait Context {
    fn request(&self) -> Option<&dyn Message>;
    fn response(&self) -> Option<&dyn Message>;
    fn env(&self, key: &str) -> Option<Value>;
    fn set_env(&mut self, key: &str, value: Value);
}

/// In-memory [`Message`]: a body and a list of headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exchange {
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl Exchange {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl Message for Exchange {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

/// [`Context`] backed by a `HashMap`. Handy for tests and for hosts that do
/// not need their own storage.
#[derive(Clone, Debug, Default)]
pub struct MapContext {
    env: HashMap<String, Value>,
    request: Option<Exchange>,
    response: Option<Exchange>,
}

impl MapContext {
    #[must_use]
    pub fn with_request(mut self, request: Exchange) -> Self {
        self.request = Some(request);
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: Exchange) -> Self {
        self.response = Some(response);
        self
    }

    pub fn set_response(&mut self, response: Exchange) {
        self.response = Some(response);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.env.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn env_map(&self) -> &HashMap<String, Value> {
        &self.env
    }
}

impl Context for MapContext {
    fn request(&self) -> Option<&dyn Message> {
        self.request.as_ref().map(|m| m as &dyn Message)
    }

    fn response(&self) -> Option<&dyn Message> {
        self.response.as_ref().map(|m| m as &dyn Message)
    }

    fn env(&self, key: &str) -> Option<Value> {
        self.env.get(key).cloned()
    }

    fn set_env(&mut self, key: &str, value: Value) {
        self.env.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let msg = Exchange::new("").with_header("Content-Type", "application/grpc");
        assert_eq!(msg.header("content-type").as_deref(), Some("application/grpc"));
        assert_eq!(msg.header("CONTENT-TYPE").as_deref(), Some("application/grpc"));
        assert_eq!(msg.header("server"), None);
    }

    #[test]
    fn map_context_env() {
        let mut ctx = MapContext::default();
        assert_eq!(ctx.env("a"), None);
        ctx.set_env("a", Value::Int(1));
        assert_eq!(ctx.get("a"), Some(&Value::Int(1)));
        ctx.insert("b", "two");
        assert_eq!(ctx.env("b"), Some(Value::from("two")));
        assert!(ctx.request().is_none());
    }
}
