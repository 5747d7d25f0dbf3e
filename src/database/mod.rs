//! Per-node storage: the session factory every other component talks to.
//!
//! A [`Store`] hands out exclusive [`Session`]s. A session is a single
//! database connection; it carries at most one open local transaction and is
//! released when dropped. Row locking and isolation semantics are whatever
//! the backing database provides.

use std::fmt::{self, Debug};
use std::str::FromStr;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod config;
pub mod postgres;
pub mod records;
pub mod schema;
pub mod sqlite;

pub use error::{Error, Result};
pub use config::DatabaseConfig;
pub use records::{NewRecord, Record};

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DatabaseType {
    /// SQLite database
    #[default]
    SQLite,
    /// PostgreSQL database
    PostgreSQL,
}

/// SQL dialect spoken by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite; `$n` placeholders are rewritten to `?n`
    Sqlite,
    /// PostgreSQL
    Postgres,
}

/// The four standard SQL isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Dirty reads allowed
    #[serde(rename = "READ UNCOMMITTED")]
    ReadUncommitted,
    /// Only committed data is visible
    #[serde(rename = "READ COMMITTED")]
    ReadCommitted,
    /// Reads are stable for the lifetime of the transaction
    #[serde(rename = "REPEATABLE READ")]
    RepeatableRead,
    /// Full serializability
    #[serde(rename = "SERIALIZABLE")]
    Serializable,
}

impl IsolationLevel {
    /// Every level, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// SQL spelling of the level
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = crate::Error;

    /// Accepts the SQL spelling in any case, with `_` or `-` for spaces.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_ascii_uppercase()
            .replace(['_', '-'], " ");
        let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        IsolationLevel::ALL
            .into_iter()
            .find(|level| level.as_sql() == normalized)
            .ok_or_else(|| {
                crate::Error::validation(format!(
                    "invalid isolation level {:?}, expected one of: READ UNCOMMITTED, READ COMMITTED, REPEATABLE READ, SERIALIZABLE",
                    s
                ))
            })
    }
}

/// One database connection with at most one open local transaction.
///
/// SQL uses `$1`-style placeholders in both dialects. Dropping the session
/// releases the connection; callers roll back before dropping.
#[async_trait]
pub trait Session: Send {
    /// Dialect of the underlying connection
    fn dialect(&self) -> Dialect;

    /// Sets the isolation level and opens a local transaction
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<()>;

    /// Commits the open transaction
    async fn commit(&mut self) -> Result<()>;

    /// Rolls back the open transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Whether a local transaction is open
    fn in_transaction(&self) -> bool;

    /// Executes a statement that returns no rows
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Executes a statement that returns rows
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Executes a statement and returns the first row, if any
    async fn query_opt(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }
}

/// Session factory for one node's database.
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Dialect of sessions handed out by this store
    fn dialect(&self) -> Dialect;

    /// Opens a new exclusive session
    async fn session(&self) -> Result<Box<dyn Session>>;

    /// Executes a single auto-committed statement
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut session = self.session().await?;
        session.execute(sql, params).await
    }

    /// Runs a single auto-committed query
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut session = self.session().await?;
        session.query(sql, params).await
    }
}

/// Row represents a database row
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Gets a column value by name
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let idx = self.columns.iter()
            .position(|c| c == column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;
        T::from_value(&self.values[idx]).map_err(|_| Error::TypeMismatch(column.to_string()))
    }

    /// Column names in select order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Value represents a database value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text
    Text(String),
    /// Binary blob
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Trait for converting SQL values to Rust types
pub trait FromValue: Sized {
    /// Converts a value, failing on a type mismatch
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(*b as i64),
            _ => Err(Error::TypeMismatch("i64".into())),
        }
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => u32::try_from(*i).map_err(|_| Error::TypeMismatch("u32".into())),
            _ => Err(Error::TypeMismatch("u32".into())),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(Error::TypeMismatch("f64".into())),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => Err(Error::TypeMismatch("bool".into())),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(Error::TypeMismatch("String".into())),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Opens the store described by `config` and makes sure its schema exists.
pub async fn create_store(config: &DatabaseConfig) -> Result<Arc<dyn Store>> {
    config.validate()?;

    let store: Arc<dyn Store> = match config.db_type {
        DatabaseType::SQLite => Arc::new(sqlite::SqliteStore::open(config)?),
        DatabaseType::PostgreSQL => Arc::new(postgres::PostgresStore::connect(config).await?),
    };
    schema::ensure_schema(store.as_ref()).await?;
    Ok(store)
}

/// Opens the store holding a node's copy of the liveness table.
///
/// PostgreSQL keeps the copy in the node database itself. SQLite locks the
/// whole file on write, so its copy lives in the companion file named by
/// [`DatabaseConfig::status_companion`].
pub async fn create_status_store(config: &DatabaseConfig, node_store: &Arc<dyn Store>) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.db_type {
        DatabaseType::SQLite => Arc::new(sqlite::SqliteStore::open(&config.status_companion())?),
        DatabaseType::PostgreSQL => node_store.clone(),
    };
    schema::ensure_status_schema(store.as_ref()).await?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!("repeatable read".parse::<IsolationLevel>().unwrap(), IsolationLevel::RepeatableRead);
        assert_eq!(" READ_COMMITTED ".parse::<IsolationLevel>().unwrap(), IsolationLevel::ReadCommitted);
        assert_eq!("Serializable".parse::<IsolationLevel>().unwrap(), IsolationLevel::Serializable);
        assert!(matches!(
            "SNAPSHOT".parse::<IsolationLevel>(),
            Err(crate::Error::Validation(_))
        ));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(Some(2.5)), Value::Float(2.5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(f64::from_value(&Value::Int(3)).unwrap(), 3.0);
        assert_eq!(Option::<i64>::from_value(&Value::Null).unwrap(), None);
        assert!(bool::from_value(&Value::Int(1)).unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new_sqlite(dir.path().join("node.db").to_string_lossy());
        let store = create_store(&config).await.unwrap();

        store.execute(
            "INSERT INTO node_status (node_id, online, updated_at) VALUES ($1, $2, $3)",
            &[Value::from(1i64), Value::from(1i64), Value::from(42i64)],
        ).await.unwrap();

        let rows = store.query(
            "SELECT online, updated_at FROM node_status WHERE node_id = $1",
            &[Value::from(1i64)],
        ).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert!(rows[0].get::<bool>("online").unwrap());
        assert_eq!(rows[0].get::<i64>("updated_at").unwrap(), 42);
        assert!(matches!(rows[0].get::<i64>("missing"), Err(Error::ColumnNotFound(_))));
    }
}
