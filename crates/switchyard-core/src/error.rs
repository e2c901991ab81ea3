//! Error types for Switchyard Core
//!
//! The `Display` form of the routing/authorization variants is the wire
//! classification callers match on (`NOT_FOUND`, `UNAUTHORIZED_API`, ...).
//! Business errors coming back from a reached node are carried verbatim.

use std::fmt;
use thiserror::Error;

/// Why a backend node could not be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Connection refused, DNS failure, no route to host
    Unreachable,
    /// The node did not answer within its reply timeout
    Timeout,
    /// The connection was closed while the call was in flight
    Closed,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Unreachable => write!(f, "UNREACHABLE"),
            TransportErrorKind::Timeout => write!(f, "TIMEOUT"),
            TransportErrorKind::Closed => write!(f, "CONNECTION_CLOSED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("NOT_FOUND")]
    NotFound,

    #[error("UNAUTHORIZED_API")]
    Unauthorized,

    #[error("MANDATORY_IE_MISSING: [{0}]")]
    MandatoryFieldMissing(String),

    /// Broadcast reached some nodes but not all; `reply` holds the merged
    /// result of the nodes that succeeded
    #[error("PARTIALLY_EXECUTED")]
    PartiallyExecuted {
        reply: Box<serde_json::Value>,
        failed_nodes: Vec<String>,
    },

    #[error("UNSUPPORTED_SERVICE_METHOD")]
    UnsupportedMethod(String),

    // Connectivity errors, the only class that triggers failover
    #[error("{kind}: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("DISPATCHER_ERROR:{0}")]
    DispatchFailed(String),

    /// Authoritative answer from a reached node, passed through untouched
    #[error("{0}")]
    Business(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Build a transport-classified error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Error::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Build a business error from a backend's answer
    pub fn business(message: impl Into<String>) -> Self {
        Error::Business(message.into())
    }

    /// Whether the dispatcher may try another node after this error
    pub fn should_failover(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Reply data delivered alongside a partial broadcast failure
    pub fn partial_reply(&self) -> Option<&serde_json::Value> {
        match self {
            Error::PartiallyExecuted { reply, .. } => Some(reply),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
