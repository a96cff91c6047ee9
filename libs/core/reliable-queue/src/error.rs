//! Queue error types and error kinds
//!
//! Errors carry a kind so callers can branch without inspecting messages:
//! - **Empty**: nothing to pop, reported as `Ok(None)` by the public API
//! - **Transient**: store or network failure, safe to retry later
//! - **Malformed**: a staged entry could not be decoded
//! - **Permanent**: configuration or serialization problems

use thiserror::Error;

/// Kind of a queue error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The queue had no element to pop
    Empty,
    /// Temporary failure, the operation may succeed if repeated
    Transient,
    /// Undecodable staged envelope
    Malformed,
    /// Will not succeed without a change of input or configuration
    Permanent,
}

impl ErrorKind {
    /// Whether an operation failing with this kind is worth repeating
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Reliable queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// The store had no element to pop
    #[error("Queue is empty")]
    Empty,

    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Staged envelope without a valid expiry prefix
    #[error("Malformed envelope: {0:?}")]
    Malformed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// A handler refused the payload during validation
    #[error("Message validation failed: {0}")]
    Rejected(String),
}

impl QueueError {
    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        QueueError::Handler(message.into())
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Empty => ErrorKind::Empty,
            QueueError::Redis(_) => ErrorKind::Transient,
            QueueError::Malformed(_) => ErrorKind::Malformed,
            QueueError::Serialization(_) => ErrorKind::Permanent,
            QueueError::Config(_) => ErrorKind::Permanent,
            QueueError::Handler(_) => ErrorKind::Transient,
            QueueError::Rejected(_) => ErrorKind::Permanent,
        }
    }

    /// Check whether this is the "nothing to pop" signal
    pub fn is_empty(&self) -> bool {
        self.kind() == ErrorKind::Empty
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type QueueResult<T> = Result<T, QueueError>;
