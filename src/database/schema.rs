//! Table definitions shared by every node store.
//!
//! Each node carries the same four tables: the `trans` rows it owns, its
//! outbox (`replication_log`), the ledger of deliveries it has accepted
//! (`replication_applied`) and its copy of the node status registry. A
//! status-only store gets just the last one.

use tracing::debug;

use super::{Dialect, Error, Result, Store};

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS trans (
        trans_id INTEGER PRIMARY KEY,
        account_id INTEGER NOT NULL,
        trans_date TEXT NOT NULL,
        type TEXT NOT NULL,
        amount REAL NOT NULL,
        balance REAL NOT NULL,
        last_updated_by_node INTEGER NOT NULL,
        version INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS replication_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_node INTEGER NOT NULL,
        target_node INTEGER NOT NULL,
        trans_id INTEGER NOT NULL,
        op_type TEXT NOT NULL,
        amount_before REAL,
        balance_before REAL,
        amount_after REAL,
        balance_after REAL,
        created_at INTEGER NOT NULL,
        applied INTEGER NOT NULL DEFAULT 0,
        applied_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_replication_log_pending
        ON replication_log (target_node, applied, id)",
    "CREATE TABLE IF NOT EXISTS replication_applied (
        source_node INTEGER NOT NULL,
        log_id INTEGER NOT NULL,
        trans_id INTEGER NOT NULL,
        applied_at INTEGER NOT NULL,
        PRIMARY KEY (source_node, log_id)
    )",
    SQLITE_STATUS_TABLE,
];

const SQLITE_STATUS_TABLE: &str = "CREATE TABLE IF NOT EXISTS node_status (
        node_id INTEGER PRIMARY KEY,
        online INTEGER NOT NULL DEFAULT 1,
        updated_at INTEGER NOT NULL
    )";

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS trans (
        trans_id BIGINT PRIMARY KEY,
        account_id BIGINT NOT NULL,
        trans_date TEXT NOT NULL,
        type TEXT NOT NULL,
        amount DOUBLE PRECISION NOT NULL,
        balance DOUBLE PRECISION NOT NULL,
        last_updated_by_node BIGINT NOT NULL,
        version BIGINT NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS replication_log (
        id BIGSERIAL PRIMARY KEY,
        source_node BIGINT NOT NULL,
        target_node BIGINT NOT NULL,
        trans_id BIGINT NOT NULL,
        op_type TEXT NOT NULL,
        amount_before DOUBLE PRECISION,
        balance_before DOUBLE PRECISION,
        amount_after DOUBLE PRECISION,
        balance_after DOUBLE PRECISION,
        created_at BIGINT NOT NULL,
        applied BIGINT NOT NULL DEFAULT 0,
        applied_at BIGINT
    )",
    "CREATE INDEX IF NOT EXISTS idx_replication_log_pending
        ON replication_log (target_node, applied, id)",
    "CREATE TABLE IF NOT EXISTS replication_applied (
        source_node BIGINT NOT NULL,
        log_id BIGINT NOT NULL,
        trans_id BIGINT NOT NULL,
        applied_at BIGINT NOT NULL,
        PRIMARY KEY (source_node, log_id)
    )",
    POSTGRES_STATUS_TABLE,
];

const POSTGRES_STATUS_TABLE: &str = "CREATE TABLE IF NOT EXISTS node_status (
        node_id BIGINT PRIMARY KEY,
        online BIGINT NOT NULL DEFAULT 1,
        updated_at BIGINT NOT NULL
    )";

/// DDL statements for a dialect, in creation order
pub fn statements(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::Sqlite => SQLITE_SCHEMA,
        Dialect::Postgres => POSTGRES_SCHEMA,
    }
}

/// Creates any missing tables. Safe to call on every start.
pub async fn ensure_schema(store: &dyn Store) -> Result<()> {
    let mut session = store.session().await?;
    for ddl in statements(store.dialect()) {
        session.execute(ddl, &[])
            .await
            .map_err(|e| Error::Schema(e.to_string()))?;
    }
    debug!(dialect = ?store.dialect(), "schema ready");
    Ok(())
}

/// Creates the liveness table alone, for stores that hold only a status copy.
pub async fn ensure_status_schema(store: &dyn Store) -> Result<()> {
    let ddl = match store.dialect() {
        Dialect::Sqlite => SQLITE_STATUS_TABLE,
        Dialect::Postgres => POSTGRES_STATUS_TABLE,
    };
    store.execute(ddl, &[])
        .await
        .map_err(|e| Error::Schema(e.to_string()))?;
    Ok(())
}
