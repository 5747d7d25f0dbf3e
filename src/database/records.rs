//! Access to `trans` rows through an open session.

use serde::{Deserialize, Serialize};

use super::{Dialect, FromValue, Result, Row, Session, Value};
use crate::cluster::NodeId;

const SELECT_RECORD: &str = "SELECT trans_id, account_id, trans_date, type, amount, balance, \
     last_updated_by_node, version FROM trans WHERE trans_id = $1";

/// A `trans` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Global identity, stable across every node holding a copy
    pub trans_id: i64,
    /// Owning account
    pub account_id: i64,
    /// Transaction date as stored
    pub date: String,
    /// Category that decides fragment ownership
    #[serde(rename = "type")]
    pub record_type: String,
    /// Amount
    pub amount: f64,
    /// Running balance
    pub balance: f64,
    /// Node whose write produced this version
    pub last_updated_by_node: NodeId,
    /// Bumped on every write application on this node
    pub version: i64,
}

/// Caller-supplied fields for a new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    /// Owning account
    pub account_id: i64,
    /// Transaction date
    pub date: String,
    /// Category that decides fragment ownership
    #[serde(rename = "type")]
    pub record_type: String,
    /// Amount
    pub amount: f64,
    /// Running balance
    pub balance: f64,
}

impl Record {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            trans_id: row.get("trans_id")?,
            account_id: row.get("account_id")?,
            date: row.get("trans_date")?,
            record_type: row.get("type")?,
            amount: row.get("amount")?,
            balance: row.get("balance")?,
            last_updated_by_node: row.get("last_updated_by_node")?,
            version: row.get("version")?,
        })
    }
}

/// Plain read.
pub async fn fetch(session: &mut dyn Session, trans_id: i64) -> Result<Option<Record>> {
    session.query_opt(SELECT_RECORD, &[Value::from(trans_id)])
        .await?
        .as_ref()
        .map(Record::from_row)
        .transpose()
}

/// Read that also takes the row's write lock, blocking behind other writers
/// until they finish or the store's lock timeout expires.
pub async fn fetch_for_update(session: &mut dyn Session, trans_id: i64) -> Result<Option<Record>> {
    match session.dialect() {
        Dialect::Postgres => {
            let sql = format!("{} FOR UPDATE", SELECT_RECORD);
            session.query_opt(&sql, &[Value::from(trans_id)])
                .await?
                .as_ref()
                .map(Record::from_row)
                .transpose()
        }
        Dialect::Sqlite => {
            // A no-op write grabs the writer lock before the snapshot is read.
            session.execute(
                "UPDATE trans SET version = version WHERE trans_id = $1",
                &[Value::from(trans_id)],
            ).await?;
            fetch(session, trans_id).await
        }
    }
}

/// Type of a row, if present.
pub async fn fetch_type(session: &mut dyn Session, trans_id: i64) -> Result<Option<String>> {
    match session.query_opt("SELECT type FROM trans WHERE trans_id = $1", &[Value::from(trans_id)]).await? {
        Some(row) => Ok(Some(row.get("type")?)),
        None => Ok(None),
    }
}

/// Overwrites amount and balance, bumping the version. Returns rows affected.
pub async fn write_values(
    session: &mut dyn Session,
    trans_id: i64,
    amount: f64,
    balance: f64,
    by_node: NodeId,
) -> Result<u64> {
    session.execute(
        "UPDATE trans SET amount = $1, balance = $2, last_updated_by_node = $3, version = version + 1 \
         WHERE trans_id = $4",
        &[Value::from(amount), Value::from(balance), Value::from(by_node), Value::from(trans_id)],
    ).await
}

/// Removes a row. Returns rows affected.
pub async fn delete(session: &mut dyn Session, trans_id: i64) -> Result<u64> {
    session.execute("DELETE FROM trans WHERE trans_id = $1", &[Value::from(trans_id)]).await
}

/// Serializes inserters on this node so id allocation cannot race.
pub async fn lock_for_insert(session: &mut dyn Session) -> Result<()> {
    match session.dialect() {
        Dialect::Postgres => {
            session.execute("LOCK TABLE trans IN SHARE ROW EXCLUSIVE MODE", &[]).await?;
        }
        Dialect::Sqlite => {
            session.execute("UPDATE trans SET version = version WHERE trans_id < 0", &[]).await?;
        }
    }
    Ok(())
}

/// Next free trans_id this node may mint.
///
/// Ids are interleaved by node: node `n` only mints ids congruent to `n`
/// modulo `node_count`, above everything it currently stores.
pub async fn next_trans_id(session: &mut dyn Session, node: NodeId, node_count: u32) -> Result<i64> {
    let max_id = match session.query_opt("SELECT COALESCE(MAX(trans_id), 0) AS max_id FROM trans", &[]).await? {
        Some(row) => row.get::<i64>("max_id")?,
        None => 0,
    };
    Ok(allocate_id(max_id, node, node_count))
}

pub(crate) fn allocate_id(max_id: i64, node: NodeId, node_count: u32) -> i64 {
    let modulus = i64::from(node_count.max(1));
    let residue = i64::from(node.get()) % modulus;
    let mut next = max_id.max(0) + 1;
    let offset = (residue - next.rem_euclid(modulus)).rem_euclid(modulus);
    next += offset;
    next
}

/// Inserts a brand new row at version 1.
pub async fn insert(session: &mut dyn Session, record: &Record) -> Result<()> {
    session.execute(
        "INSERT INTO trans (trans_id, account_id, trans_date, type, amount, balance, last_updated_by_node, version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        &record_params(record),
    ).await?;
    Ok(())
}

/// Inserts a replicated row, or overwrites the local copy and bumps its
/// version if one exists.
pub async fn upsert(session: &mut dyn Session, record: &Record) -> Result<()> {
    session.execute(
        "INSERT INTO trans (trans_id, account_id, trans_date, type, amount, balance, last_updated_by_node, version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (trans_id) DO UPDATE SET \
           account_id = excluded.account_id, \
           trans_date = excluded.trans_date, \
           type = excluded.type, \
           amount = excluded.amount, \
           balance = excluded.balance, \
           last_updated_by_node = excluded.last_updated_by_node, \
           version = trans.version + 1",
        &record_params(record),
    ).await?;
    Ok(())
}

fn record_params(record: &Record) -> [Value; 8] {
    [
        Value::from(record.trans_id),
        Value::from(record.account_id),
        Value::from(record.date.as_str()),
        Value::from(record.record_type.as_str()),
        Value::from(record.amount),
        Value::from(record.balance),
        Value::from(record.last_updated_by_node),
        Value::from(record.version),
    ]
}

impl FromValue for NodeId {
    fn from_value(value: &Value) -> Result<Self> {
        u32::from_value(value).map(NodeId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{create_store, DatabaseConfig, IsolationLevel, Store};
    use tempfile::tempdir;

    fn record(trans_id: i64, record_type: &str) -> Record {
        Record {
            trans_id,
            account_id: 42,
            date: "2024-03-01".into(),
            record_type: record_type.into(),
            amount: 100.0,
            balance: 1000.0,
            last_updated_by_node: NodeId::new(1),
            version: 1,
        }
    }

    #[test]
    fn test_allocate_id_interleaves_nodes() {
        assert_eq!(allocate_id(0, NodeId::new(1), 3), 1);
        assert_eq!(allocate_id(0, NodeId::new(2), 3), 2);
        assert_eq!(allocate_id(0, NodeId::new(3), 3), 3);
        assert_eq!(allocate_id(7, NodeId::new(1), 3), 10);
        assert_eq!(allocate_id(7, NodeId::new(2), 3), 8);
        assert_eq!(allocate_id(7, NodeId::new(3), 3), 9);
    }

    #[tokio::test]
    async fn test_upsert_bumps_existing_version() {
        let dir = tempdir().unwrap();
        let store = create_store(&DatabaseConfig::new_sqlite(dir.path().join("n.db").to_string_lossy()))
            .await
            .unwrap();
        let mut session = store.session().await.unwrap();

        upsert(session.as_mut(), &record(5, "Credit")).await.unwrap();
        let first = fetch(session.as_mut(), 5).await.unwrap().unwrap();
        assert_eq!(first.version, 1);

        let mut changed = record(5, "Credit");
        changed.amount = 250.0;
        upsert(session.as_mut(), &changed).await.unwrap();
        let second = fetch(session.as_mut(), 5).await.unwrap().unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.amount, 250.0);
    }

    #[tokio::test]
    async fn test_write_lock_read_and_update() {
        let dir = tempdir().unwrap();
        let store = create_store(&DatabaseConfig::new_sqlite(dir.path().join("n.db").to_string_lossy()))
            .await
            .unwrap();
        let mut session = store.session().await.unwrap();
        insert(session.as_mut(), &record(7, "VYBER")).await.unwrap();

        session.begin(IsolationLevel::RepeatableRead).await.unwrap();
        let locked = fetch_for_update(session.as_mut(), 7).await.unwrap().unwrap();
        assert_eq!(locked.version, 1);
        assert_eq!(write_values(session.as_mut(), 7, 90.0, 990.0, NodeId::new(3)).await.unwrap(), 1);
        session.commit().await.unwrap();

        let row = fetch(session.as_mut(), 7).await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.last_updated_by_node, NodeId::new(3));
        assert_eq!(fetch_type(session.as_mut(), 7).await.unwrap().as_deref(), Some("VYBER"));
        assert!(fetch_for_update(session.as_mut(), 99).await.unwrap().is_none());
    }
}
