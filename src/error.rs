//! Error types for the fragmesh library.
//!
//! Callers can tell "bad input" (`Validation`, `NotFound`) apart from
//! "retry me" (`Conflict`, `Offline`). Replication failures are contained in
//! the delivery engine and only appear here when a caller drives delivery
//! directly.

use thiserror::Error;

use crate::database;

/// Primary error type encompassing all possible errors in the library.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown node id, invalid isolation level or otherwise malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown or finished transaction, or a missing record
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write-lock wait exceeded or the store refused the write; safe to retry
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The node is marked offline in the liveness registry
    #[error("Node offline: {0}")]
    Offline(String),

    /// Delivery of an outbox entry failed
    #[error("Replication error: {0}")]
    Replication(String),

    /// Storage errors that are not conflicts
    #[error("Database error: {0}")]
    Database(database::Error),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal library errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Creates a new not-found error with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new conflict error with the given message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Creates a new offline error with the given message.
    pub fn offline(msg: impl Into<String>) -> Self {
        Error::Offline(msg.into())
    }

    /// Creates a new replication error with the given message.
    pub fn replication(msg: impl Into<String>) -> Self {
        Error::Replication(msg.into())
    }

    /// Creates a new internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Offline(_) | Error::Replication(_))
    }
}

impl From<database::Error> for Error {
    fn from(err: database::Error) -> Self {
        match err {
            database::Error::Duplicate(msg) => Error::Conflict(format!("duplicate key: {}", msg)),
            database::Error::Config(msg) => Error::Config(msg),
            other if other.is_retryable() => Error::Conflict(other.to_string()),
            other => Error::Database(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}
