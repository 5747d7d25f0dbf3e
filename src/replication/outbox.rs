//! The per-node outbox (`replication_log`) and the ledger of accepted
//! deliveries (`replication_applied`).

use std::collections::BTreeSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{millis_to_datetime, OpType};
use crate::cluster::{NodeId, Router};
use crate::database::{self, Row, Session, Store, Value};
use crate::error::Result;

const ENTRY_COLUMNS: &str = "id, source_node, target_node, trans_id, op_type, amount_before, balance_before, \
     amount_after, balance_after, created_at, applied, applied_at";

/// One pending or delivered write notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic id, unique within the source node's outbox
    pub id: i64,
    /// Node that recorded the write
    pub source_node: NodeId,
    /// Node the write must reach
    pub target_node: NodeId,
    /// Affected row
    pub trans_id: i64,
    /// Kind of write
    pub op_type: OpType,
    /// Amount before the write
    pub amount_before: Option<f64>,
    /// Balance before the write
    pub balance_before: Option<f64>,
    /// Amount after the write
    pub amount_after: Option<f64>,
    /// Balance after the write
    pub balance_after: Option<f64>,
    /// When the entry was queued
    pub created_at: DateTime<Utc>,
    /// Whether the target accepted it
    pub applied: bool,
    /// When it was marked applied
    pub applied_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    fn from_row(row: &Row) -> Result<Self> {
        let op_type: String = row.get("op_type")?;
        let applied_at: Option<i64> = row.get("applied_at")?;
        Ok(Self {
            id: row.get("id")?,
            source_node: row.get("source_node")?,
            target_node: row.get("target_node")?,
            trans_id: row.get("trans_id")?,
            op_type: op_type.parse()?,
            amount_before: row.get("amount_before")?,
            balance_before: row.get("balance_before")?,
            amount_after: row.get("amount_after")?,
            balance_after: row.get("balance_after")?,
            created_at: millis_to_datetime(row.get("created_at")?),
            applied: row.get("applied")?,
            applied_at: applied_at.map(millis_to_datetime),
        })
    }
}

/// What to queue for one row write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueParams {
    /// Node recording the write
    pub source_node: NodeId,
    /// Affected row
    pub trans_id: i64,
    /// The row's type, used for routing
    pub record_type: String,
    /// Kind of write
    pub op_type: OpType,
    /// Amount before
    pub amount_before: Option<f64>,
    /// Balance before
    pub balance_before: Option<f64>,
    /// Amount after
    pub amount_after: Option<f64>,
    /// Balance after
    pub balance_after: Option<f64>,
}

/// Appends one entry per routing target inside the caller's open
/// transaction. Returns the targets queued to.
pub async fn queue_for_row(
    session: &mut dyn Session,
    router: &Router,
    params: &QueueParams,
) -> Result<BTreeSet<NodeId>> {
    let targets = router.determine_targets(params.source_node, &params.record_type);
    for &target in &targets {
        enqueue(session, target, params).await?;
    }
    Ok(targets)
}

/// Appends a single entry toward `target`.
pub async fn enqueue(session: &mut dyn Session, target: NodeId, params: &QueueParams) -> Result<()> {
    session.execute(
        "INSERT INTO replication_log \
         (source_node, target_node, trans_id, op_type, amount_before, balance_before, amount_after, balance_after, created_at, applied) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)",
        &[
            Value::from(params.source_node),
            Value::from(target),
            Value::from(params.trans_id),
            Value::from(params.op_type.as_str()),
            Value::from(params.amount_before),
            Value::from(params.balance_before),
            Value::from(params.amount_after),
            Value::from(params.balance_after),
            Value::from(Utc::now().timestamp_millis()),
        ],
    ).await?;
    Ok(())
}

/// Oldest unapplied entries toward `target`, ascending by id.
pub async fn pending(store: &dyn Store, target: NodeId, limit: usize) -> Result<Vec<OutboxEntry>> {
    let sql = format!(
        "SELECT {} FROM replication_log WHERE applied = 0 AND target_node = $1 ORDER BY id ASC LIMIT $2",
        ENTRY_COLUMNS
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    store.query(&sql, &[Value::from(target), Value::from(limit)])
        .await?
        .iter()
        .map(OutboxEntry::from_row)
        .collect()
}

/// Every entry in the outbox, applied or not, ascending by id.
pub async fn entries(store: &dyn Store) -> Result<Vec<OutboxEntry>> {
    let sql = format!("SELECT {} FROM replication_log ORDER BY id ASC", ENTRY_COLUMNS);
    store.query(&sql, &[]).await?.iter().map(OutboxEntry::from_row).collect()
}

/// Flags an entry as delivered. Already-applied entries are left untouched.
pub async fn mark_applied(store: &dyn Store, id: i64) -> database::Result<u64> {
    store.execute(
        "UPDATE replication_log SET applied = 1, applied_at = $1 WHERE id = $2 AND applied = 0",
        &[Value::from(Utc::now().timestamp_millis()), Value::from(id)],
    ).await
}

/// Unapplied entry counts per target node.
pub async fn backlog(store: &dyn Store) -> Result<Vec<(NodeId, i64)>> {
    let rows = store.query(
        "SELECT target_node, COUNT(*) AS pending FROM replication_log WHERE applied = 0 \
         GROUP BY target_node ORDER BY target_node",
        &[],
    ).await?;
    rows.iter()
        .map(|row| -> Result<(NodeId, i64)> { Ok((row.get("target_node")?, row.get("pending")?)) })
        .collect()
}

/// Whether the target has already accepted entry `log_id` from `source`.
pub async fn ledger_contains(session: &mut dyn Session, source: NodeId, log_id: i64) -> Result<bool> {
    let row = session.query_opt(
        "SELECT log_id FROM replication_applied WHERE source_node = $1 AND log_id = $2",
        &[Value::from(source), Value::from(log_id)],
    ).await?;
    Ok(row.is_some())
}

/// Records acceptance of entry `log_id` from `source` on the target.
pub async fn record_in_ledger(session: &mut dyn Session, source: NodeId, log_id: i64, trans_id: i64) -> Result<()> {
    session.execute(
        "INSERT INTO replication_applied (source_node, log_id, trans_id, applied_at) VALUES ($1, $2, $3, $4)",
        &[
            Value::from(source),
            Value::from(log_id),
            Value::from(trans_id),
            Value::from(Utc::now().timestamp_millis()),
        ],
    ).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::cluster::Topology;
    use crate::database::{create_store, DatabaseConfig, IsolationLevel};
    use tempfile::tempdir;

    fn params(source: u32, trans_id: i64, record_type: &str) -> QueueParams {
        QueueParams {
            source_node: NodeId::new(source),
            trans_id,
            record_type: record_type.into(),
            op_type: OpType::Update,
            amount_before: Some(10.0),
            balance_before: Some(100.0),
            amount_after: Some(20.0),
            balance_after: Some(110.0),
        }
    }

    #[tokio::test]
    async fn test_queue_and_drain_order() {
        let dir = tempdir().unwrap();
        let store = create_store(&DatabaseConfig::new_sqlite(dir.path().join("n3.db").to_string_lossy()))
            .await
            .unwrap();
        let router = Router::new(Arc::new(Topology::default()));

        let mut session = store.session().await.unwrap();
        session.begin(IsolationLevel::ReadCommitted).await.unwrap();
        for trans_id in 1..=10 {
            let targets = queue_for_row(session.as_mut(), &router, &params(3, trans_id, "VYBER")).await.unwrap();
            assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec![NodeId::new(1)]);
        }
        session.commit().await.unwrap();

        let first = pending(store.as_ref(), NodeId::new(1), 5).await.unwrap();
        assert_eq!(first.len(), 5);
        assert!(first.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(first[0].trans_id, 1);
        assert_eq!(first[0].amount_after, Some(20.0));
        assert!(!first[0].applied);

        assert_eq!(mark_applied(store.as_ref(), first[0].id).await.unwrap(), 1);
        assert_eq!(mark_applied(store.as_ref(), first[0].id).await.unwrap(), 0);

        let rest = pending(store.as_ref(), NodeId::new(1), 100).await.unwrap();
        assert_eq!(rest.len(), 9);
        assert_eq!(backlog(store.as_ref()).await.unwrap(), vec![(NodeId::new(1), 9)]);
        assert!(pending(store.as_ref(), NodeId::new(2), 100).await.unwrap().is_empty());

        let all = entries(store.as_ref()).await.unwrap();
        assert!(all[0].applied && all[0].applied_at.is_some());
    }

    #[tokio::test]
    async fn test_unowned_type_on_hub_queues_nothing() {
        let dir = tempdir().unwrap();
        let store = create_store(&DatabaseConfig::new_sqlite(dir.path().join("n1.db").to_string_lossy()))
            .await
            .unwrap();
        let router = Router::new(Arc::new(Topology::default()));
        let mut session = store.session().await.unwrap();

        let targets = queue_for_row(session.as_mut(), &router, &params(1, 4, "Interest")).await.unwrap();
        assert!(targets.is_empty());
        assert!(entries(store.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger() {
        let dir = tempdir().unwrap();
        let store = create_store(&DatabaseConfig::new_sqlite(dir.path().join("n1.db").to_string_lossy()))
            .await
            .unwrap();
        let mut session = store.session().await.unwrap();

        assert!(!ledger_contains(session.as_mut(), NodeId::new(2), 1).await.unwrap());
        record_in_ledger(session.as_mut(), NodeId::new(2), 1, 8).await.unwrap();
        assert!(ledger_contains(session.as_mut(), NodeId::new(2), 1).await.unwrap());
        assert!(!ledger_contains(session.as_mut(), NodeId::new(3), 1).await.unwrap());
        assert!(record_in_ledger(session.as_mut(), NodeId::new(2), 1, 8).await.is_err());
    }
}
