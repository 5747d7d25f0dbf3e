use std::error::Error as StdError;
use std::fmt;

/// Database error type
#[derive(Debug)]
pub enum Error {
    /// Connection error
    Connection(String),
    /// Query error
    Query(String),
    /// Transaction control error (begin/commit/rollback)
    Transaction(String),
    /// Lock wait exceeded, serialization failure or deadlock
    Busy(String),
    /// Unique key violation
    Duplicate(String),
    /// Type mismatch error
    TypeMismatch(String),
    /// Column not found error
    ColumnNotFound(String),
    /// Schema bootstrap error
    Schema(String),
    /// Configuration error
    Config(String),
}

impl Error {
    /// Whether the caller may retry the same work later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::Duplicate(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Transaction(msg) => write!(f, "Transaction error: {}", msg),
            Error::Busy(msg) => write!(f, "Lock wait exceeded: {}", msg),
            Error::Duplicate(msg) => write!(f, "Duplicate key: {}", msg),
            Error::TypeMismatch(col) => write!(f, "Type mismatch for column: {}", col),
            Error::ColumnNotFound(col) => write!(f, "Column not found: {}", col),
            Error::Schema(msg) => write!(f, "Schema error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl StdError for Error {}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, Error>;
