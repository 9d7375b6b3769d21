use crate::{
    context::{Context, Message},
    error::{Capability, Error, Result},
    parser::{BinaryOp, Node, parse},
    token::{Attr, Function, Global, Literal},
    value::{Handle, Side, Value},
};

/// Lexes, parses and evaluates `source` against `ctx`.
///
/// Evaluation stops at the first error. Assignments made before the error
/// have already reached `ctx`.
///
/// # Errors
///
/// Any lexing, parsing or evaluation [`Error`].
pub fn evaluate(source: &str, ctx: &mut dyn Context) -> Result<Value> {
    let node = parse(source)?;
    evaluate_node(&node, ctx)
}

/// Evaluates an already parsed tree.
///
/// # Errors
///
/// Any evaluation [`Error`].
pub fn evaluate_node(node: &Node, ctx: &mut dyn Context) -> Result<Value> {
    Evaluator { ctx }.eval(node)
}

/// Right-hand side of a dot.
enum Name<'n> {
    Attr(Attr),
    Field(&'n str),
    Index(i64),
}

impl Name<'_> {
    fn of(node: &Node) -> Result<Name<'_>> {
        match node {
            Node::Attr(attr) => Ok(Name::Attr(*attr)),
            Node::Variable(name) => Ok(Name::Field(name)),
            Node::Literal(Literal::Int(i)) => Ok(Name::Index(*i)),
            other => Err(Error::InvalidAttribute {
                found: other.describe(),
            }),
        }
    }

    fn unknown_on(&self, receiver: &Value) -> Error {
        let name = match self {
            Name::Attr(attr) => attr.lexeme().to_string(),
            Name::Field(field) => (*field).to_string(),
            Name::Index(i) => i.to_string(),
        };
        Error::UnknownAttribute {
            value: receiver.type_name(),
            name,
        }
    }
}

struct Evaluator<'a> {
    ctx: &'a mut dyn Context,
}

impl Evaluator<'_> {
    fn eval(&mut self, node: &Node) -> Result<Value> {
        match node {
            Node::Global(Global::Env) => Ok(Value::Handle(Handle::Env)),
            Node::Global(Global::Res) => Ok(Value::Handle(Handle::Message(Side::Response))),
            Node::Global(Global::Req) => Ok(Value::Handle(Handle::Message(Side::Request))),
            Node::Attr(attr) => Err(Error::DetachedAttribute {
                attr: attr.lexeme(),
            }),
            Node::Variable(name) => Err(Error::UnboundVariable { name: name.clone() }),
            Node::Literal(literal) => Ok(Value::from(literal.clone())),
            Node::Binary {
                op: BinaryOp::Dot,
                left,
                right,
            } => {
                let receiver = self.eval(left)?;
                let name = Name::of(right)?;
                self.get(&receiver, &name)
            }
            Node::Binary {
                op: BinaryOp::Assign,
                left,
                right,
            } => self.assign(left, right),
            Node::Call { function, args } => self.call(*function, args),
        }
    }

    fn get(&self, receiver: &Value, name: &Name<'_>) -> Result<Value> {
        if !receiver.supports(Capability::Get) {
            return Err(Error::Capability {
                value: receiver.type_name(),
                capability: Capability::Get,
            });
        }

        match (receiver, name) {
            (Value::Handle(Handle::Env), Name::Field(key)) => {
                Ok(self.ctx.env(key).unwrap_or(Value::Null))
            }
            (Value::Handle(Handle::Message(side)), Name::Attr(Attr::Body)) => {
                Ok(Value::Handle(Handle::Body(*side)))
            }
            (Value::Handle(Handle::Message(side)), Name::Attr(Attr::Header)) => {
                Ok(Value::Handle(Handle::Headers(*side)))
            }
            (
                Value::Handle(Handle::Body(side)),
                Name::Attr(attr @ (Attr::Str | Attr::Raw | Attr::Json)),
            ) => {
                let body = self.message(*side)?.body();
                match attr {
                    Attr::Str => Ok(Value::Str(String::from_utf8_lossy(body).into_owned())),
                    Attr::Raw => Ok(Value::Bytes(body.to_vec())),
                    _ => serde_json::from_slice(body)
                        .map(Value::from_json)
                        .map_err(|e| Error::Json(e.to_string())),
                }
            }
            (Value::Handle(Handle::Headers(side)), Name::Field(key)) => Ok(self
                .message(*side)?
                .header(key)
                .map_or(Value::Null, Value::Str)),
            (Value::Json(serde_json::Value::Object(map)), Name::Field(key)) => {
                Ok(map.get(*key).cloned().map_or(Value::Null, Value::from_json))
            }
            (Value::Json(serde_json::Value::Object(map)), Name::Index(i)) => Ok(map
                .get(&i.to_string())
                .cloned()
                .map_or(Value::Null, Value::from_json)),
            (Value::Json(serde_json::Value::Array(items)), Name::Index(i)) => Ok(usize::try_from(*i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .map_or(Value::Null, Value::from_json)),
            (receiver, name) => Err(name.unknown_on(receiver)),
        }
    }

    fn assign(&mut self, target: &Node, source: &Node) -> Result<Value> {
        let Node::Binary {
            op: BinaryOp::Dot,
            left,
            right,
        } = target
        else {
            return Err(Error::InvalidAssignment {
                target: target.describe(),
            });
        };

        let receiver = self.eval(left)?;
        if !receiver.supports(Capability::Set) {
            return Err(Error::Capability {
                value: receiver.type_name(),
                capability: Capability::Set,
            });
        }
        let key = match Name::of(right)? {
            Name::Field(key) => key,
            other => return Err(other.unknown_on(&receiver)),
        };

        let value = self.eval(source)?;
        if let Value::Handle(_) = value {
            return Err(Error::NotStorable {
                value: value.type_name(),
            });
        }
        self.ctx.set_env(key, value.clone());
        Ok(value)
    }

    fn call(&mut self, function: Function, args: &[Node]) -> Result<Value> {
        match function {
            Function::Contain => {
                let [haystack, needle] = args else {
                    return Err(Error::Arity {
                        function: function.name(),
                        expected: 2,
                        found: args.len(),
                    });
                };
                let haystack = self.eval(haystack)?;
                let needle = match self.eval(needle)? {
                    Value::Str(s) => s,
                    other => {
                        return Err(Error::ArgumentType {
                            function: function.name(),
                            position: 2,
                            expected: "a string",
                            found: other.type_name(),
                        });
                    }
                };
                Ok(Value::Bool(haystack.to_text().contains(&needle)))
            }
        }
    }

    fn message(&self, side: Side) -> Result<&dyn Message> {
        let message = match side {
            Side::Request => self.ctx.request(),
            Side::Response => self.ctx.response(),
        };
        message.ok_or(Error::Unavailable(side.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Exchange, MapContext};
    use serde_json::json;

    fn with_body(body: &str) -> MapContext {
        MapContext::default().with_response(Exchange::new(body))
    }

    #[test]
    fn assigns_literal_into_env() {
        let mut ctx = MapContext::default();
        assert_eq!(evaluate("$env.a = 1", &mut ctx).unwrap(), Value::Int(1));
        assert_eq!(ctx.get("a"), Some(&Value::Int(1)));
        assert_eq!(evaluate("$env.a", &mut ctx).unwrap(), Value::Int(1));
    }

    #[test]
    fn chained_assignment_writes_both_keys() {
        let mut ctx = MapContext::default();
        evaluate(r#"$env.a = $env.b = "x""#, &mut ctx).unwrap();
        assert_eq!(ctx.get("a"), Some(&Value::from("x")));
        assert_eq!(ctx.get("b"), Some(&Value::from("x")));
    }

    #[test]
    fn missing_env_key_is_null() {
        let mut ctx = MapContext::default();
        assert_eq!(evaluate("$env.nothing", &mut ctx).unwrap(), Value::Null);
    }

    #[test]
    fn contain_checks_response_text() {
        let mut ctx = with_body(r#"{"status":"ok"}"#);
        let expr = r#"@contain($res.$body.$str, "ok")"#;
        assert_eq!(evaluate(expr, &mut ctx).unwrap(), Value::Bool(true));

        let mut ctx = with_body(r#"{"status":"failed"}"#);
        assert_eq!(evaluate(expr, &mut ctx).unwrap(), Value::Bool(false));
    }

    #[test]
    fn contain_uses_string_form_of_first_argument() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate(r#"@contain(12345, "234")"#, &mut ctx).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn contain_rejects_non_string_needle() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate(r#"@contain("abc", 1)"#, &mut ctx).unwrap_err(),
            Error::ArgumentType {
                function: "contain",
                position: 2,
                expected: "a string",
                found: "int",
            }
        );
    }

    #[test]
    fn contain_arity() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate(r#"@contain("abc")"#, &mut ctx).unwrap_err(),
            Error::Arity {
                function: "contain",
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn json_field_extraction() {
        let mut ctx = with_body(r#"{"accessToken":"abc","user":{"id":7,"tags":["a","b"]}}"#);
        assert_eq!(
            evaluate("$res.$body.$json.accessToken", &mut ctx).unwrap(),
            Value::from("abc")
        );
        assert_eq!(
            evaluate("$res.$body.$json.user.id", &mut ctx).unwrap(),
            Value::Int(7)
        );
        assert_eq!(
            evaluate("$res.$body.$json.user.tags.1", &mut ctx).unwrap(),
            Value::from("b")
        );
        assert_eq!(
            evaluate("$res.$body.$json.user", &mut ctx).unwrap(),
            Value::Json(json!({"id": 7, "tags": ["a", "b"]}))
        );
    }

    #[test]
    fn malformed_json_aborts_before_assignment() {
        let mut ctx = with_body("{not json");
        let err = evaluate("$env.token = $res.$body.$json.accessToken", &mut ctx).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert_eq!(ctx.get("token"), None);
    }

    #[test]
    fn extracted_value_feeds_env() {
        let mut ctx = with_body(r#"{"accessToken":"abc"}"#);
        evaluate("$env.token = $res.$body.$json.accessToken", &mut ctx).unwrap();
        assert_eq!(ctx.get("token"), Some(&Value::from("abc")));
    }

    #[test]
    fn raw_and_header_attributes() {
        let mut ctx = MapContext::default()
            .with_request(Exchange::new("ping").with_header("X-Trace", "t-1"));
        assert_eq!(
            evaluate("$req.$body.$raw", &mut ctx).unwrap(),
            Value::Bytes(b"ping".to_vec())
        );
        assert_eq!(
            evaluate("$req.$header.trace", &mut ctx).unwrap(),
            Value::Null
        );
        ctx = ctx.with_request(Exchange::new("").with_header("Trace", "t-2"));
        assert_eq!(
            evaluate("$req.$header.TRACE", &mut ctx).unwrap(),
            Value::from("t-2")
        );
    }

    #[test]
    fn handles_are_lazy() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate("$res.$body", &mut ctx).unwrap(),
            Value::Handle(Handle::Body(Side::Response))
        );
        assert_eq!(
            evaluate("$res.$body.$str", &mut ctx).unwrap_err(),
            Error::Unavailable("response")
        );
    }

    #[test]
    fn get_requires_capability() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate(r#""abc".len"#, &mut ctx).unwrap_err(),
            Error::Capability {
                value: "string",
                capability: Capability::Get,
            }
        );
    }

    #[test]
    fn set_requires_capability() {
        let mut ctx = with_body("{}");
        assert_eq!(
            evaluate("$res.$body = 1", &mut ctx).unwrap_err(),
            Error::Capability {
                value: "$res",
                capability: Capability::Set,
            }
        );
        assert_eq!(
            evaluate("$res.$body.$json.a = 1", &mut ctx).unwrap_err(),
            Error::Capability {
                value: "object",
                capability: Capability::Set,
            }
        );
    }

    #[test]
    fn assignment_target_must_be_a_path() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate("$env = 1", &mut ctx).unwrap_err(),
            Error::InvalidAssignment { target: "a global" }
        );
        assert_eq!(
            evaluate("$env.$body = 1", &mut ctx).unwrap_err(),
            Error::UnknownAttribute {
                value: "$env",
                name: "$body".into(),
            }
        );
    }

    #[test]
    fn handles_cannot_be_stored() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate("$env.a = $res", &mut ctx).unwrap_err(),
            Error::NotStorable { value: "$res" }
        );
        assert_eq!(ctx.get("a"), None);
    }

    #[test]
    fn bare_names_are_unbound() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate("token", &mut ctx).unwrap_err(),
            Error::UnboundVariable {
                name: "token".into()
            }
        );
        assert_eq!(
            evaluate("$body", &mut ctx).unwrap_err(),
            Error::DetachedAttribute { attr: "$body" }
        );
    }

    #[test]
    fn unknown_attribute_on_handle() {
        let mut ctx = with_body("{}");
        assert_eq!(
            evaluate("$res.$json", &mut ctx).unwrap_err(),
            Error::UnknownAttribute {
                value: "$res",
                name: "$json".into(),
            }
        );
    }

    #[test]
    fn dot_rhs_must_be_a_name() {
        let mut ctx = MapContext::default();
        assert_eq!(
            evaluate(r#"$env."x""#, &mut ctx).unwrap_err(),
            Error::InvalidAttribute { found: "a string" }
        );
    }

    #[test]
    fn first_error_wins_and_earlier_effects_remain() {
        let mut ctx = MapContext::default();
        let err = evaluate(r#"@contain($env.a = "x", 1)"#, &mut ctx).unwrap_err();
        assert!(matches!(err, Error::ArgumentType { .. }));
        assert_eq!(ctx.get("a"), Some(&Value::from("x")));
    }
}
