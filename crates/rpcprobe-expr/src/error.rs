//! Error types for the expression engine.
//!
//! Every phase (lexing, parsing, evaluation) reports through the same
//! [`Error`] enum. Evaluation stops at the first error; whether the caller
//! keeps evaluating other expressions is up to the caller.
//!
//! ## Error Cases
//! - Lexing: `UnexpectedChar`, `UnknownKeyword`, `UnterminatedString`,
//!   `InvalidNumber`.
//! - Parsing: `UnexpectedToken`, `TooDeep`.
//! - Evaluation: `Capability`, `InvalidAttribute`, `UnknownAttribute`,
//!   `UnboundVariable`, `DetachedAttribute`, `InvalidAssignment`, `NotStorable`, `Arity`,
//!   `ArgumentType`, `Unavailable`, `Json`.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// An operation set a value must support for a dot or an assignment to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// `value.name`
    Get,
    /// `value.name = expr`
    Set,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Get => write!(f, "attribute access"),
            Capability::Set => write!(f, "assignment"),
        }
    }
}

/// Unified error type for lexing, parsing and evaluating expressions.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// A character that cannot start any token.
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },

    /// A `$` or `@` word that is not in the keyword table.
    #[error("unknown keyword `{keyword}` at offset {offset}")]
    UnknownKeyword { keyword: String, offset: usize },

    /// A string literal with no closing quote.
    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },

    /// A numeric literal that does not fit its type.
    #[error("invalid number literal `{literal}` at offset {offset}")]
    InvalidNumber { literal: String, offset: usize },

    /// The parser found a token it cannot use at this position.
    #[error("expected {expected} but found {found} at offset {offset}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        offset: usize,
    },

    /// The expression nests more levels than the parser accepts.
    #[error("expression nests deeper than {limit} levels at offset {offset}")]
    TooDeep { limit: usize, offset: usize },

    /// The value does not support the operation applied to it.
    #[error("{value} does not support {capability}")]
    Capability {
        value: &'static str,
        capability: Capability,
    },

    /// The right-hand side of a dot is not a name.
    #[error("{found} cannot be used as an attribute name")]
    InvalidAttribute { found: &'static str },

    /// The value supports attribute access but has no such attribute.
    #[error("{value} has no attribute `{name}`")]
    UnknownAttribute { value: &'static str, name: String },

    /// A bare identifier that is not the right-hand side of a dot.
    #[error("unbound variable `{name}`")]
    UnboundVariable { name: String },

    /// An attribute such as `$body` used without a receiver.
    #[error("`{attr}` must follow a dot")]
    DetachedAttribute { attr: &'static str },

    /// The left-hand side of `=` is not an attribute path.
    #[error("cannot assign to {target}")]
    InvalidAssignment { target: &'static str },

    /// Only plain data can be written into the environment.
    #[error("{value} cannot be stored in the environment")]
    NotStorable { value: &'static str },

    /// Wrong number of arguments in a function call.
    #[error("@{function} expects {expected} arguments, got {found}")]
    Arity {
        function: &'static str,
        expected: usize,
        found: usize,
    },

    /// A function argument of the wrong type.
    #[error("@{function} argument {position} must be {expected}, got {found}")]
    ArgumentType {
        function: &'static str,
        position: usize,
        expected: &'static str,
        found: &'static str,
    },

    /// The context has no request or response to read from.
    #[error("no {0} is available in this context")]
    Unavailable(&'static str),

    /// The body could not be parsed as JSON.
    #[error("body is not valid JSON: {0}")]
    Json(String),
}
