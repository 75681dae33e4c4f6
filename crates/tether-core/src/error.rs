//! Error types for the tether engine.
//!
//! Every local failure of an outbound call is delivered through the call's
//! completion as an `RpcError`. Failures caused by the peer travel the other
//! way, as the `err` string of a reply envelope (see [`RpcError::wire_message`]).

use crate::config::RpcConfig;
use crate::engine::Seq;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Main error type for the tether engine.
#[derive(Debug, Error)]
pub enum RpcError {
    // Inbound envelope errors
    #[error("Decode error: {message}")]
    Decode { message: String },

    // Dispatch errors
    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Handler for {method} failed: {message}")]
    Handler { method: String, message: String },

    /// Error string returned by the peer in a reply envelope.
    #[error("{0}")]
    Remote(String),

    // Call lifecycle errors
    #[error("Invalid call: {message}")]
    InvalidCall { message: String },

    #[error("timeout after {after:?} (seq {seq})")]
    Timeout { seq: Seq, after: Duration },

    #[error("call {seq} cancelled")]
    Cancelled { seq: Seq },

    #[error("engine closed")]
    Closed,

    #[error("too many pending calls (limit {limit})")]
    TooManyPending { limit: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("duplicate sequence number {0}")]
    DuplicateSequence(Seq),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Create a decode error from anything printable.
    pub fn decode(message: impl Into<String>) -> Self {
        RpcError::Decode {
            message: message.into(),
        }
    }

    /// The string placed in the `err` field of a reply envelope.
    ///
    /// Script peers compare against the bare `"Unknown method"` and
    /// `"timeout"` texts, so those cases drop the method name and details.
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::UnknownMethod { .. } => RpcConfig::UNKNOWN_METHOD.to_string(),
            RpcError::Timeout { .. } => RpcConfig::TIMEOUT.to_string(),
            RpcError::Handler { message, .. } => message.clone(),
            RpcError::Remote(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the peer reported that it has no handler for the method.
    pub fn is_unknown_method(&self) -> bool {
        match self {
            RpcError::UnknownMethod { .. } => true,
            RpcError::Remote(message) => message == RpcConfig::UNKNOWN_METHOD,
            _ => false,
        }
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}
