use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use super::DatabaseType;
use crate::config::duration_ms;

/// Database configuration for one node store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database type (SQLite or PostgreSQL)
    pub db_type: DatabaseType,

    /// Database host (PostgreSQL only)
    pub host: Option<String>,

    /// Database port (PostgreSQL only)
    pub port: Option<u16>,

    /// Database user (PostgreSQL only)
    pub user: Option<String>,

    /// Database password (PostgreSQL only)
    pub password: Option<String>,

    /// Database name
    pub database: String,

    /// SQLite file path (SQLite only)
    pub sqlite_path: Option<String>,

    /// Maximum number of pooled connections (PostgreSQL only)
    pub max_connections: u32,

    /// Pooled connection idle timeout
    #[serde(with = "duration_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,

    /// Connection timeout
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,

    /// How long a session waits for a conflicting row lock before giving up
    #[serde(with = "duration_ms", rename = "lock_timeout_ms")]
    pub lock_timeout: Duration,

    /// SSL mode (PostgreSQL only)
    pub ssl_mode: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DatabaseType::default(),
            host: None,
            port: None,
            user: None,
            password: None,
            database: String::from("fragmesh"),
            sqlite_path: Some(String::from("fragmesh.db")),
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
            ssl_mode: None,
        }
    }
}

impl DatabaseConfig {
    /// Creates a new SQLite configuration
    pub fn new_sqlite(path: impl Into<String>) -> Self {
        Self {
            db_type: DatabaseType::SQLite,
            sqlite_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Creates a new PostgreSQL configuration
    pub fn new_postgres(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            db_type: DatabaseType::PostgreSQL,
            host: Some(host.into()),
            port: Some(port),
            user: Some(user.into()),
            password: Some(password.into()),
            database: database.into(),
            sqlite_path: None,
            ..Default::default()
        }
    }

    /// Sets the lock wait timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Configuration of the store that holds this node's liveness copy.
    ///
    /// For SQLite it is a sibling file, `node1.db` becoming `node1.status.db`,
    /// so status writes never queue behind the node's writer lock. Other
    /// backends lock rows and keep the copy in the node database.
    pub fn status_companion(&self) -> Self {
        let mut config = self.clone();
        if self.db_type == DatabaseType::SQLite {
            config.sqlite_path = self.sqlite_path
                .as_deref()
                .map(|path| Path::new(path).with_extension("status.db").to_string_lossy().into_owned());
        }
        config
    }

    /// Validates the configuration
    pub fn validate(&self) -> super::Result<()> {
        match self.db_type {
            DatabaseType::SQLite => {
                if self.sqlite_path.is_none() {
                    return Err(super::Error::Config("SQLite path is required".into()));
                }
            }
            DatabaseType::PostgreSQL => {
                if self.host.is_none() {
                    return Err(super::Error::Config("PostgreSQL host is required".into()));
                }
                if self.port.is_none() {
                    return Err(super::Error::Config("PostgreSQL port is required".into()));
                }
                if self.user.is_none() {
                    return Err(super::Error::Config("PostgreSQL user is required".into()));
                }
                if self.password.is_none() {
                    return Err(super::Error::Config("PostgreSQL password is required".into()));
                }
                if self.max_connections == 0 {
                    return Err(super::Error::Config("max_connections must be positive".into()));
                }
            }
        }
        if self.lock_timeout.is_zero() {
            return Err(super::Error::Config("lock timeout must be positive".into()));
        }
        Ok(())
    }
}
