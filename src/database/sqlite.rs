use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode};

use super::{Dialect, Error, IsolationLevel, Result, Row, Session, Store, Value, DatabaseConfig};

/// SQLite store: every session is its own connection to the node's file.
///
/// The database runs in WAL mode so readers never block the single writer.
/// SQLite only has one writer lock per file, so a write-lock read on any row
/// serializes against every other writer on the node, and every isolation
/// level behaves as serializable.
///
/// Transactions begin deferred. The first write inside one restarts it with
/// `BEGIN IMMEDIATE`, so a transaction that has only read waits for the
/// writer lock and then sees the latest committed rows, the way a locking
/// read does in MySQL or PostgreSQL at READ COMMITTED.
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    lock_timeout: Duration,
}

/// SQLite session implementation
pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    in_tx: bool,
    /// Holds the writer lock for the open transaction
    writer: bool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file named in `config`.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = config.sqlite_path
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config("SQLite path not provided".into()))?;

        // Switch the file to WAL once up front; the mode is persistent.
        connect(&path, config.lock_timeout)?;

        Ok(Self {
            path,
            lock_timeout: config.lock_timeout,
        })
    }
}

fn connect(path: &PathBuf, lock_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| Error::Connection(e.to_string()))?;
    conn.busy_timeout(lock_timeout)
        .map_err(|e| Error::Connection(e.to_string()))?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .map_err(|e| Error::Connection(e.to_string()))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")
        .map_err(|e| Error::Connection(e.to_string()))?;
    Ok(conn)
}

fn map_err(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::Busy(err.to_string()),
            ErrorCode::ConstraintViolation
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Error::Duplicate(err.to_string())
            }
            _ => Error::Query(err.to_string()),
        },
        _ => Error::Query(err.to_string()),
    }
}

/// Ends a transaction that has only read and reopens it holding the writer
/// lock. SQLite answers a write on a stale read snapshot with
/// `SQLITE_BUSY_SNAPSHOT` without consulting the busy handler; an
/// `IMMEDIATE` begin waits on it instead.
fn promote_to_writer(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("COMMIT; BEGIN IMMEDIATE;").map_err(map_err)
}

fn rewrite_placeholders(sql: &str) -> String {
    sql.replace('$', "?")
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*b as i64)),
            Value::Int(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl SqliteSession {
    /// Runs `f` against the connection on the blocking pool; lock waits
    /// inside SQLite's busy handler must not stall the runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Connection(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl Session for SqliteSession {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        let read_uncommitted = isolation == IsolationLevel::ReadUncommitted;
        self.run(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA read_uncommitted = {}; BEGIN DEFERRED;",
                read_uncommitted as i32
            ))
            .map_err(|e| Error::Transaction(e.to_string()))
        })
        .await?;
        self.in_tx = true;
        self.writer = false;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.run(|conn| conn.execute_batch("COMMIT").map_err(map_err)).await?;
        self.in_tx = false;
        self.writer = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run(|conn| {
            // SQLite may already have rolled back on its own after some errors.
            if conn.is_autocommit() {
                return Ok(());
            }
            conn.execute_batch("ROLLBACK")
                .map_err(|e| Error::Transaction(e.to_string()))
        })
        .await?;
        self.in_tx = false;
        self.writer = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<u64> {
        if self.in_tx && !self.writer {
            self.run(promote_to_writer).await?;
            self.writer = true;
        }

        let sql = rewrite_placeholders(query);
        let params = params.to_vec();
        self.run(move |conn| {
            conn.execute(&sql, rusqlite::params_from_iter(params.iter()))
                .map(|rows| rows as u64)
                .map_err(map_err)
        })
        .await
    }

    async fn query(&mut self, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = rewrite_placeholders(query);
        let params = params.to_vec();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_err)?;

            let columns: Arc<[String]> = stmt.column_names()
                .iter()
                .map(|&name| name.to_string())
                .collect();

            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))
                .map_err(map_err)?;

            let mut result = Vec::new();
            while let Some(row) = rows.next().map_err(map_err)? {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    let value = match row.get_ref(i).map_err(map_err)? {
                        ValueRef::Null => Value::Null,
                        ValueRef::Integer(i) => Value::Int(i),
                        ValueRef::Real(f) => Value::Float(f),
                        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
                        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
                    };
                    values.push(value);
                }
                result.push(Row::new(columns.clone(), values));
            }
            Ok(result)
        })
        .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn session(&self) -> Result<Box<dyn Session>> {
        let path = self.path.clone();
        let lock_timeout = self.lock_timeout;
        let conn = tokio::task::spawn_blocking(move || connect(&path, lock_timeout))
            .await
            .map_err(|e| Error::Connection(format!("blocking task failed: {}", e)))??;

        Ok(Box::new(SqliteSession {
            conn: Arc::new(Mutex::new(conn)),
            in_tx: false,
            writer: false,
        }))
    }
}
