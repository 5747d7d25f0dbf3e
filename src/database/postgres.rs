use std::error::Error as StdError;
use std::sync::Arc;
use async_trait::async_trait;
use bb8_postgres::bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use bytes::BytesMut;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Config, NoTls};

use super::{Dialect, Error, IsolationLevel, Result, Row, Session, Store, Value, DatabaseConfig};

type Manager = PostgresConnectionManager<NoTls>;

/// PostgreSQL store backed by a bb8 connection pool.
pub struct PostgresStore {
    pool: Pool<Manager>,
    lock_timeout_ms: u128,
}

/// A pooled connection checked out for exclusive use.
pub struct PostgresSession {
    conn: PooledConnection<'static, Manager>,
    in_tx: bool,
}

impl PostgresStore {
    /// Builds the pool; connections are established lazily.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg_config = Config::new();
        pg_config.host(config.host.as_deref().unwrap_or("localhost"));
        pg_config.port(config.port.unwrap_or(5432));
        pg_config.user(config.user.as_deref().unwrap_or("postgres"));
        pg_config.password(config.password.as_deref().unwrap_or(""));
        pg_config.dbname(&config.database);
        pg_config.connect_timeout(config.connect_timeout);

        if let Some(ssl_mode) = &config.ssl_mode {
            pg_config.ssl_mode(match ssl_mode.as_str() {
                "disable" => tokio_postgres::config::SslMode::Disable,
                "prefer" => tokio_postgres::config::SslMode::Prefer,
                "require" => tokio_postgres::config::SslMode::Require,
                other => return Err(Error::Config(format!("Invalid SSL mode: {}", other))),
            });
        }

        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .idle_timeout(Some(config.idle_timeout))
            .connection_timeout(config.connect_timeout)
            .build(manager)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            lock_timeout_ms: config.lock_timeout.as_millis(),
        })
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool", &self.pool.state())
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .finish()
    }
}

fn map_err(err: tokio_postgres::Error) -> Error {
    match err.code() {
        Some(code)
            if *code == SqlState::LOCK_NOT_AVAILABLE
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::QUERY_CANCELED =>
        {
            Error::Busy(err.to_string())
        }
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => Error::Duplicate(err.to_string()),
        _ => Error::Query(err.to_string()),
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => {
                if *ty == Type::BOOL {
                    b.to_sql(ty, out)
                } else {
                    Value::Int(*b as i64).to_sql(ty, out)
                }
            }
            Value::Int(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*i as f32).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Float(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            Value::Text(s) => s.to_sql(ty, out),
            Value::Bytes(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn convert_row(row: &tokio_postgres::Row, columns: &Arc<[String]>) -> Result<Row> {
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let mismatch = |_| Error::TypeMismatch(column.name().to_string());
        let value = if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i).map_err(mismatch)?.map(Value::Int)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i).map_err(mismatch)?.map(|v| Value::Int(v as i64))
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i).map_err(mismatch)?.map(|v| Value::Int(v as i64))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i).map_err(mismatch)?.map(Value::Float)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i).map_err(mismatch)?.map(|v| Value::Float(v as f64))
        } else if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i).map_err(mismatch)?.map(Value::Bool)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(i).map_err(mismatch)?.map(Value::Bytes)
        } else {
            row.try_get::<_, Option<String>>(i).map_err(mismatch)?.map(Value::Text)
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(Row::new(columns.clone(), values))
}

fn as_params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter()
        .map(|v| v as &(dyn ToSql + Sync))
        .collect()
}

#[async_trait]
impl Session for PostgresSession {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.conn.batch_execute(&format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql()))
            .await
            .map_err(|e| Error::Transaction(e.to_string()))?;
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.batch_execute("COMMIT").await.map_err(map_err)?;
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.conn.batch_execute("ROLLBACK")
            .await
            .map_err(|e| Error::Transaction(e.to_string()))?;
        self.in_tx = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<u64> {
        self.conn.execute(query, &as_params(params)[..])
            .await
            .map_err(map_err)
    }

    async fn query(&mut self, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = self.conn.query(query, &as_params(params)[..])
            .await
            .map_err(map_err)?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first.columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect();

        rows.iter().map(|row| convert_row(row, &columns)).collect()
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn session(&self) -> Result<Box<dyn Session>> {
        let conn = self.pool.get_owned().await.map_err(|e| match e {
            RunError::User(e) => Error::Connection(e.to_string()),
            RunError::TimedOut => Error::Connection("timed out waiting for a pooled connection".into()),
        })?;

        // A session dropped mid-transaction returns its connection still open
        conn.batch_execute(&format!("ROLLBACK; SET lock_timeout = {}", self.lock_timeout_ms))
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Box::new(PostgresSession { conn, in_tx: false }))
    }
}
