//! Error types for the call engine.
//!
//! This module defines the central `Error` enum covering method resolution,
//! transport, and call execution. A failed call keeps the server's
//! `tonic::Status` intact in [`Error::Status`].
//!
//! ## Error Cases
//! - Resolution: `InvalidTarget`, `Schema`, `SymbolNotFound`, `NotAService`,
//!   `MethodNotFound`, `Reflection`.
//! - Transport: `DialTimeout`, `Unreachable`, `InvalidConfig`, `Transport`.
//! - Call: `Status`, `Provider`, `InvalidMessage`, `DeadlineExceeded`,
//!   `NoData`.
//!
//! End-of-stream and last-message signals from a message provider are not
//! errors; see [`StreamMessage`](crate::StreamMessage).

use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the call engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The method target string could not be split into service and method.
    #[error("invalid method target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: &'static str },

    /// A proto file, descriptor set, or reflected file could not be read or
    /// linked.
    #[error("failed to load schema from {origin}: {reason}")]
    Schema { origin: String, reason: String },

    /// No service with this name exists in the schema.
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),

    /// The name resolves to a message, enum, or other non-service symbol.
    #[error("symbol `{0}` is not a service")]
    NotAService(String),

    /// The service exists but has no such method.
    #[error("service `{service}` has no method `{method}`")]
    MethodNotFound { service: String, method: String },

    /// The reflection service answered with an error or an unexpected
    /// response.
    #[error("reflection failed: {0}")]
    Reflection(String),

    /// The connection was not established within the dial timeout.
    #[error("timed out connecting to {host} after {timeout:?}")]
    DialTimeout { host: String, timeout: Duration },

    /// The connection was refused, the host was unreachable, or the handshake
    /// failed.
    #[error("cannot reach {host}: {reason}")]
    Unreachable { host: String, reason: String },

    /// Transport options that cannot be applied (bad URI, bad TLS material).
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// Transport failure after the connection was established.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The call failed with a gRPC status.
    #[error("call failed: {0}")]
    Status(Box<Status>),

    /// The message provider returned an error; the call was aborted.
    #[error("message provider failed: {0}")]
    Provider(String),

    /// A message payload did not match its schema.
    #[error("invalid {message} payload: {reason}")]
    InvalidMessage { message: String, reason: String },

    /// The call-level timeout elapsed.
    #[error("call exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    /// The run had neither input messages nor a message provider.
    #[error("no data provided for request")]
    NoData,
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Status(Box::new(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_errors_name_the_target() {
        let err = Error::InvalidTarget {
            target: "pkg.Service".into(),
            reason: "missing method",
        };
        assert!(err.to_string().contains("pkg.Service"));
    }
}
