//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. None of
//! them cross a transport boundary as-is: the kernel downgrades every error to
//! a structured `{code, error}` reply via [`Error::reply_code`].

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the dispatch fabric.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed descriptor or request (400).
    #[error("validation error: {0}")]
    Validation(String),

    /// No handler, member or pending task (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller not allowed to use this path or channel (403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Internal errors (500).
    #[error("internal error: {0}")]
    Internal(String),

    /// Pending task cancelled before a reply arrived (500).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Pending task timed out (504).
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer channel (unit, node, connection) is gone (503).
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error-coded reply produced on the far side of a channel.
    #[error("remote error {code}: {error}")]
    Remote { code: u16, error: String },

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Numeric code used when this error is surfaced as a reply.
    pub fn reply_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::ChannelClosed(_) => 503,
            Error::Timeout(_) => 504,
            Error::Remote { code, .. } => *code,
            Error::Internal(_)
            | Error::Cancelled(_)
            | Error::Serialization(_)
            | Error::Io(_) => 500,
        }
    }

    /// gRPC status for failures of the gateway itself; routed requests
    /// always answer with a reply.
    pub fn to_grpc_status(&self) -> tonic::Status {
        match self {
            Error::Validation(msg) => tonic::Status::invalid_argument(msg),
            Error::NotFound(msg) => tonic::Status::not_found(msg),
            Error::Forbidden(msg) => tonic::Status::permission_denied(msg),
            Error::Cancelled(msg) => tonic::Status::cancelled(msg),
            Error::Timeout(msg) => tonic::Status::deadline_exceeded(msg),
            Error::ChannelClosed(msg) => tonic::Status::unavailable(msg),
            Error::Internal(msg) => tonic::Status::internal(msg),
            Error::Remote { code, error } => {
                tonic::Status::internal(format!("remote error {}: {}", code, error))
            }
            Error::Serialization(e) => {
                tonic::Status::internal(format!("serialization error: {}", e))
            }
            Error::Io(e) => tonic::Status::internal(format!("io error: {}", e)),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    pub fn remote(code: u16, error: impl Into<String>) -> Self {
        Self::Remote {
            code,
            error: error.into(),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        err.to_grpc_status()
    }
}
