//! The facade callers talk to.
//!
//! A [`Coordinator`] wires the node stores, liveness registry, router,
//! replication engine and transaction manager together and exposes the
//! request/response operations of the system.

use std::collections::BTreeMap;
use std::sync::Arc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::{NodeId, NodeRegistry, Router, Topology};
use crate::config::{ClusterConfig, ReplicationConfig, TransactionConfig};
use crate::database::records::{self, NewRecord, Record};
use crate::database::{create_status_store, create_store, IsolationLevel, Store};
use crate::error::{Error, Result};
use crate::replication::{outbox, DrainSummary, ReplicationEngine, ReplicationMetrics};
use crate::transaction::{
    FinishedTransaction, OperationResult, ReadResult, StartedTransaction, TransactionEvent, TransactionManager,
    TxId, TxInfo, TxSummary,
};

/// Start a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    /// Node to open the session on
    pub node_id: NodeId,
    /// One of the four SQL isolation levels, any case
    pub isolation_level: String,
    /// Free-form label
    #[serde(default)]
    pub description: Option<String>,
}

/// Address a row inside a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRequest {
    /// Transaction id
    pub tx_id: TxId,
    /// trans_id of the row
    pub record_id: i64,
}

/// Delta update inside a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecordRequest {
    /// Transaction id
    pub tx_id: TxId,
    /// trans_id of the row
    pub record_id: i64,
    /// Added to the amount
    #[serde(default)]
    pub amount_delta: f64,
    /// Added to the balance
    #[serde(default)]
    pub balance_delta: f64,
}

/// Commit or roll back a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// Transaction id
    pub tx_id: TxId,
}

/// Insert a new row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRecordRequest {
    /// Node to insert on
    pub node_id: NodeId,
    /// Owning account
    pub account_id: i64,
    /// Transaction date
    pub date: String,
    /// Record type
    #[serde(rename = "type")]
    pub record_type: String,
    /// Amount
    pub amount: f64,
    /// Balance
    pub balance: f64,
}

/// Drain one (source, target) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationRequest {
    /// Node whose outbox is drained
    pub source_node_id: NodeId,
    /// Destination node
    pub target_node_id: NodeId,
    /// Maximum entries to apply; defaults to the configured batch limit
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Liveness of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Node id
    pub node_id: NodeId,
    /// Whether it is online
    pub online: bool,
}

/// Pending outbox entries for one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backlog {
    /// Node holding the entries
    pub source_node_id: NodeId,
    /// Node they are waiting to reach
    pub target_node_id: NodeId,
    /// Number of unapplied entries
    pub pending: i64,
}

/// Handles of the background loops
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Token that stops every loop when cancelled
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of loops running
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no loop was started
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops every loop and waits for them to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

/// Transaction coordination and replication across the cluster.
#[derive(Debug)]
pub struct Coordinator {
    topology: Arc<Topology>,
    stores: BTreeMap<NodeId, Arc<dyn Store>>,
    registry: Arc<NodeRegistry>,
    replication: Arc<ReplicationEngine>,
    transactions: Arc<TransactionManager>,
}

impl Coordinator {
    /// Opens every node store described by `config` and wires the cluster.
    pub async fn open(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let topology = config.topology()?;

        let mut stores = BTreeMap::new();
        let mut status_stores = BTreeMap::new();
        for node in &config.nodes {
            let store = create_store(&node.database).await.map_err(|e| {
                error!(node = %node.id, error = %e, "failed to open node store");
                Error::from(e)
            })?;
            let status = create_status_store(&node.database, &store).await.map_err(|e| {
                error!(node = %node.id, error = %e, "failed to open node status store");
                Error::from(e)
            })?;
            stores.insert(node.id, store);
            status_stores.insert(node.id, status);
        }

        Self::with_stores(topology, stores, status_stores, config.transactions, config.replication).await
    }

    /// Wires the cluster over stores that are already open.
    ///
    /// `status_stores` hold each node's liveness copy; a node missing from it
    /// keeps its copy in its node store.
    pub async fn with_stores(
        topology: Topology,
        stores: BTreeMap<NodeId, Arc<dyn Store>>,
        status_stores: BTreeMap<NodeId, Arc<dyn Store>>,
        transactions: TransactionConfig,
        replication: ReplicationConfig,
    ) -> Result<Self> {
        for id in topology.ids() {
            if !stores.contains_key(&id) {
                return Err(Error::Config(format!("no store configured for node {}", id)));
            }
        }

        let topology = Arc::new(topology);
        let router = Router::new(topology.clone());
        let registry = Arc::new(NodeRegistry::new(
            topology.ids().collect(),
            stores
                .iter()
                .map(|(id, store)| (*id, status_stores.get(id).unwrap_or(store).clone()))
                .collect(),
        ));
        registry.init().await;

        let replication = Arc::new(ReplicationEngine::new(
            replication,
            stores.clone(),
            registry.clone(),
            router.clone(),
        ));
        let transactions = Arc::new(TransactionManager::new(
            transactions,
            stores.clone(),
            registry.clone(),
            router,
            replication.clone(),
        ));

        info!(nodes = topology.len(), hub = %topology.hub(), "coordinator ready");
        Ok(Self { topology, stores, registry, replication, transactions })
    }

    /// The cluster topology
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The transaction manager
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// The replication engine
    pub fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.replication
    }

    fn store(&self, node: NodeId) -> Result<&Arc<dyn Store>> {
        self.stores
            .get(&node)
            .ok_or_else(|| Error::validation(format!("unknown node id {}", node)))
    }

    /// Opens a logical transaction.
    pub async fn start_transaction(&self, request: StartTransactionRequest) -> Result<StartedTransaction> {
        self.store(request.node_id)?;
        let isolation: IsolationLevel = request.isolation_level.parse()?;
        self.transactions.start(request.node_id, isolation, request.description).await
    }

    /// Reads a row inside a transaction.
    pub async fn read_record(&self, request: RecordRequest) -> Result<ReadResult> {
        self.transactions.read(&request.tx_id, request.record_id).await
    }

    /// Applies amount/balance deltas to a row inside a transaction.
    pub async fn update_record(&self, request: UpdateRecordRequest) -> Result<OperationResult> {
        self.transactions
            .update(&request.tx_id, request.record_id, request.amount_delta, request.balance_delta)
            .await
    }

    /// Deletes a row inside a transaction.
    pub async fn delete_record(&self, request: RecordRequest) -> Result<OperationResult> {
        self.transactions.delete(&request.tx_id, request.record_id).await
    }

    /// Commits a transaction.
    pub async fn commit_transaction(&self, request: TransactionRequest) -> Result<FinishedTransaction> {
        self.transactions.commit(&request.tx_id).await
    }

    /// Rolls back a transaction.
    pub async fn rollback_transaction(&self, request: TransactionRequest) -> Result<FinishedTransaction> {
        self.transactions.rollback(&request.tx_id).await
    }

    /// Active and recently finished transactions.
    pub fn list_transactions(&self) -> Vec<TxSummary> {
        self.transactions.list()
    }

    /// Full state of an active or recently finished transaction.
    pub fn transaction(&self, tx_id: &TxId) -> Option<TxInfo> {
        self.transactions.get(tx_id)
    }

    /// Lifecycle events of every transaction
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.transactions.subscribe()
    }

    /// Inserts a new row in its own short transaction.
    pub async fn insert_record(&self, request: InsertRecordRequest) -> Result<Record> {
        self.transactions
            .insert(request.node_id, NewRecord {
                account_id: request.account_id,
                date: request.date,
                record_type: request.record_type,
                amount: request.amount,
                balance: request.balance,
            })
            .await
    }

    /// Committed state of a row on one node, outside any logical transaction.
    pub async fn get_record(&self, node: NodeId, record_id: i64) -> Result<Option<Record>> {
        let mut session = self.store(node)?.session().await?;
        Ok(records::fetch(session.as_mut(), record_id).await?)
    }

    /// Marks a node online or offline. Coming back online kicks off a
    /// catch-up replication sweep.
    pub async fn set_node_online(&self, node: NodeId, online: bool) -> Result<NodeStatus> {
        self.registry.set_online(node, online).await?;
        if online {
            self.replication.trigger("node online").await;
        }
        Ok(NodeStatus { node_id: node, online })
    }

    /// Liveness of every node.
    pub async fn get_all_statuses(&self) -> BTreeMap<NodeId, bool> {
        self.registry.all_statuses().await
    }

    /// Drains one (source, target) pair.
    pub async fn run_replication_once(&self, request: ReplicationRequest) -> Result<DrainSummary> {
        let limit = request.limit.unwrap_or(self.replication.config().batch_limit);
        if limit == 0 {
            return Err(Error::validation("limit must be positive"));
        }
        self.replication
            .drain_once(request.source_node_id, request.target_node_id, limit)
            .await
    }

    /// One sweep over every replication pair; `None` if a sweep is already
    /// running.
    pub async fn run_auto_replication(&self) -> Option<Vec<DrainSummary>> {
        self.replication.run_auto_batch().await
    }

    /// Unapplied outbox entries per (source, target) pair.
    pub async fn outbox_backlog(&self) -> Result<Vec<Backlog>> {
        let mut backlog = Vec::new();
        for (&source, store) in &self.stores {
            for (target, pending) in outbox::backlog(store.as_ref()).await? {
                backlog.push(Backlog { source_node_id: source, target_node_id: target, pending });
            }
        }
        Ok(backlog)
    }

    /// Replication counters since start-up
    pub fn replication_metrics(&self) -> ReplicationMetrics {
        self.replication.metrics()
    }

    /// Starts the periodic replication sweep and the idle transaction
    /// sweeper, as enabled by configuration.
    pub fn start_background(&self) -> BackgroundTasks {
        let shutdown = CancellationToken::new();
        let handles = [
            self.replication.start(shutdown.child_token()),
            self.transactions.start_sweeper(shutdown.child_token()),
        ]
        .into_iter()
        .flatten()
        .collect();
        BackgroundTasks { shutdown, handles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::replication::DeliveryStatus;
    use crate::transaction::TxStatus;
    use tempfile::TempDir;

    fn node(id: u32) -> NodeId {
        NodeId::new(id)
    }

    async fn cluster(configure: impl FnOnce(&mut ClusterConfig)) -> (TempDir, Coordinator) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClusterConfig::local(dir.path());
        config.replication.enabled = false;
        configure(&mut config);
        let coordinator = Coordinator::open(config).await.unwrap();
        (dir, coordinator)
    }

    fn insert(node_id: u32, record_type: &str, amount: f64) -> InsertRecordRequest {
        InsertRecordRequest {
            node_id: node(node_id),
            account_id: 1001,
            date: "2024-05-01".into(),
            record_type: record_type.into(),
            amount,
            balance: 2_000.0,
        }
    }

    async fn start(c: &Coordinator, node_id: u32, isolation: &str) -> TxId {
        c.start_transaction(StartTransactionRequest {
            node_id: node(node_id),
            isolation_level: isolation.into(),
            description: None,
        })
        .await
        .unwrap()
        .tx_id
    }

    fn drain(source: u32, target: u32, limit: usize) -> ReplicationRequest {
        ReplicationRequest {
            source_node_id: node(source),
            target_node_id: node(target),
            limit: Some(limit),
        }
    }

    #[tokio::test]
    async fn test_fragment_insert_replicates_to_hub() {
        let (_dir, c) = cluster(|_| {}).await;

        let record = c.insert_record(insert(2, "Credit", 500.0)).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.trans_id % 3, 2);
        assert_eq!(
            c.outbox_backlog().await.unwrap(),
            vec![Backlog { source_node_id: node(2), target_node_id: node(1), pending: 1 }]
        );

        let summary = c.run_replication_once(drain(2, 1, 10)).await.unwrap();
        assert_eq!(summary.requested, 1);
        assert_eq!(summary.results[0].status, DeliveryStatus::Applied);
        assert_eq!(summary.results[0].fanout, 0);

        let on_hub = c.get_record(node(1), record.trans_id).await.unwrap().unwrap();
        assert_eq!(on_hub.amount, 500.0);
        assert_eq!(on_hub.version, 1);
        assert_eq!(on_hub.last_updated_by_node, node(2));
        assert!(c.outbox_backlog().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_over_existing_copy_bumps_version() {
        let (_dir, c) = cluster(|_| {}).await;
        let record = c.insert_record(insert(2, "Credit", 500.0)).await.unwrap();

        // The hub already holds a stale copy of the row.
        let stale = Record { amount: 1.0, version: 4, ..record.clone() };
        let mut session = c.stores[&node(1)].session().await.unwrap();
        records::insert(session.as_mut(), &stale).await.unwrap();
        drop(session);

        let summary = c.run_replication_once(drain(2, 1, 10)).await.unwrap();
        assert_eq!(summary.results[0].status, DeliveryStatus::Applied);

        let on_hub = c.get_record(node(1), record.trans_id).await.unwrap().unwrap();
        assert_eq!(on_hub.amount, 500.0);
        assert_eq!(on_hub.version, 5);
    }

    #[tokio::test]
    async fn test_insert_enforces_fragment_ownership() {
        let (_dir, c) = cluster(|_| {}).await;

        let err = c.insert_record(insert(2, "VYBER", 10.0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = c.insert_record(insert(3, "Credit", 10.0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = c.insert_record(insert(7, "Credit", 10.0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // The hub takes anything; unowned types stay on the hub.
        c.insert_record(insert(1, "Interest", 10.0)).await.unwrap();
        assert!(c.outbox_backlog().await.unwrap().is_empty());

        c.set_node_online(node(3), false).await.unwrap();
        let err = c.insert_record(insert(3, "VYBER", 10.0)).await.unwrap_err();
        assert!(matches!(err, Error::Offline(_)));
    }

    #[tokio::test]
    async fn test_ids_do_not_collide_across_nodes() {
        let (_dir, c) = cluster(|_| {}).await;
        let a = c.insert_record(insert(1, "Credit", 1.0)).await.unwrap();
        let b = c.insert_record(insert(2, "Credit", 2.0)).await.unwrap();
        let d = c.insert_record(insert(3, "VYBER", 3.0)).await.unwrap();
        assert_ne!(a.trans_id, b.trans_id);
        assert_ne!(b.trans_id, d.trans_id);
        assert_ne!(a.trans_id, d.trans_id);

        c.run_auto_replication().await.unwrap();
        c.run_auto_replication().await.unwrap();
        for id in [a.trans_id, b.trans_id, d.trans_id] {
            assert!(c.get_record(node(1), id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_update_commit_replicates_to_owner() {
        let (_dir, c) = cluster(|_| {}).await;
        let record = c.insert_record(insert(1, "VYBER", 100.0)).await.unwrap();
        c.run_replication_once(drain(1, 3, 10)).await.unwrap();

        let tx = start(&c, 1, "READ COMMITTED").await;
        let result = c.update_record(UpdateRecordRequest {
            tx_id: tx.clone(),
            record_id: record.trans_id,
            amount_delta: 25.0,
            balance_delta: -25.0,
        })
        .await
        .unwrap();
        assert_eq!(result.node_id, node(1));
        assert_eq!(result.isolation_level, IsolationLevel::ReadCommitted);

        let finished = c.commit_transaction(TransactionRequest { tx_id: tx }).await.unwrap();
        assert_eq!(finished.status, TxStatus::Committed);

        let summary = c.run_replication_once(drain(1, 3, 10)).await.unwrap();
        assert_eq!(summary.applied(), 1);
        let on_fragment = c.get_record(node(3), record.trans_id).await.unwrap().unwrap();
        assert_eq!(on_fragment.amount, 125.0);
        assert_eq!(on_fragment.balance, 1_975.0);
        assert_eq!(on_fragment.version, 2);
        assert_eq!(on_fragment.last_updated_by_node, node(1));
    }

    #[tokio::test]
    async fn test_rollback_discards_outbox_entries() {
        let (_dir, c) = cluster(|_| {}).await;
        let record = c.insert_record(insert(1, "Credit", 100.0)).await.unwrap();
        c.run_replication_once(drain(1, 2, 10)).await.unwrap();

        let tx = start(&c, 1, "SERIALIZABLE").await;
        c.delete_record(RecordRequest { tx_id: tx.clone(), record_id: record.trans_id }).await.unwrap();
        let finished = c.rollback_transaction(TransactionRequest { tx_id: tx.clone() }).await.unwrap();
        assert_eq!(finished.status, TxStatus::RolledBack);

        assert!(c.get_record(node(1), record.trans_id).await.unwrap().is_some());
        assert!(c.outbox_backlog().await.unwrap().is_empty());

        let err = c.read_record(RecordRequest { tx_id: tx, record_id: record.trans_id }).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_row_rolls_back_transaction() {
        let (_dir, c) = cluster(|_| {}).await;
        let tx = start(&c, 2, "repeatable read").await;

        let err = c.update_record(UpdateRecordRequest {
            tx_id: tx.clone(),
            record_id: 404,
            amount_delta: 1.0,
            balance_delta: 1.0,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(c.transaction(&tx).unwrap().status, TxStatus::RolledBack);
        assert_eq!(c.transactions().active_count(), 0);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let (_dir, c) = cluster(|_| {}).await;

        let err = c.start_transaction(StartTransactionRequest {
            node_id: node(4),
            isolation_level: "READ COMMITTED".into(),
            description: None,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = c.start_transaction(StartTransactionRequest {
            node_id: node(1),
            isolation_level: "SNAPSHOT".into(),
            description: None,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        c.set_node_online(node(2), false).await.unwrap();
        let err = c.start_transaction(StartTransactionRequest {
            node_id: node(2),
            isolation_level: "READ COMMITTED".into(),
            description: Some("after crash".into()),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Offline(_)));
    }

    #[tokio::test]
    async fn test_offline_node_aborts_transaction() {
        let (_dir, c) = cluster(|_| {}).await;
        let record = c.insert_record(insert(2, "Credit", 10.0)).await.unwrap();

        let tx = start(&c, 2, "READ COMMITTED").await;
        c.read_record(RecordRequest { tx_id: tx.clone(), record_id: record.trans_id }).await.unwrap();

        c.set_node_online(node(2), false).await.unwrap();
        let err = c.read_record(RecordRequest { tx_id: tx.clone(), record_id: record.trans_id }).await.unwrap_err();
        assert!(matches!(err, Error::Offline(_)));

        let info = c.transaction(&tx).unwrap();
        assert_eq!(info.status, TxStatus::RolledBack);
        assert_eq!(info.operations.len(), 1);

        let err = c.commit_transaction(TransactionRequest { tx_id: tx }).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_writer_waits_for_first() {
        let (_dir, c) = cluster(|_| {}).await;
        let c = Arc::new(c);
        let record = c.insert_record(insert(1, "VYBER", 100.0)).await.unwrap();
        let id = record.trans_id;

        let tx_a = start(&c, 1, "REPEATABLE READ").await;
        let tx_b = start(&c, 1, "REPEATABLE READ").await;

        c.update_record(UpdateRecordRequest { tx_id: tx_a.clone(), record_id: id, amount_delta: 10.0, balance_delta: 0.0 })
            .await
            .unwrap();

        let waiter = {
            let c = c.clone();
            let tx_b = tx_b.clone();
            tokio::spawn(async move {
                c.update_record(UpdateRecordRequest { tx_id: tx_b, record_id: id, amount_delta: 5.0, balance_delta: 0.0 })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!waiter.is_finished());

        c.commit_transaction(TransactionRequest { tx_id: tx_a }).await.unwrap();
        let result = waiter.await.unwrap().unwrap();
        match result.operation {
            crate::transaction::TxOperation::Update { amount_before, amount_after, .. } => {
                assert_eq!(amount_before, 110.0);
                assert_eq!(amount_after, 115.0);
            }
            other => panic!("unexpected operation {:?}", other),
        }
        c.commit_transaction(TransactionRequest { tx_id: tx_b }).await.unwrap();

        let row = c.get_record(node(1), id).await.unwrap().unwrap();
        assert_eq!(row.amount, 115.0);
        assert_eq!(row.version, 3);
    }

    #[tokio::test]
    async fn test_update_after_read_proceeds_on_committed_state() {
        let (_dir, c) = cluster(|_| {}).await;
        let record = c.insert_record(insert(1, "VYBER", 100.0)).await.unwrap();
        let id = record.trans_id;

        let tx_b = start(&c, 1, "READ COMMITTED").await;
        let seen = c.read_record(RecordRequest { tx_id: tx_b.clone(), record_id: id }).await.unwrap();
        assert_eq!(seen.row.unwrap().amount, 100.0);

        let tx_a = start(&c, 1, "READ COMMITTED").await;
        c.update_record(UpdateRecordRequest { tx_id: tx_a.clone(), record_id: id, amount_delta: 10.0, balance_delta: 0.0 })
            .await
            .unwrap();
        c.commit_transaction(TransactionRequest { tx_id: tx_a }).await.unwrap();

        let result = c
            .update_record(UpdateRecordRequest { tx_id: tx_b.clone(), record_id: id, amount_delta: 5.0, balance_delta: 0.0 })
            .await
            .unwrap();
        match result.operation {
            crate::transaction::TxOperation::Update { amount_before, amount_after, .. } => {
                assert_eq!(amount_before, 110.0);
                assert_eq!(amount_after, 115.0);
            }
            other => panic!("unexpected operation {:?}", other),
        }
        let finished = c.commit_transaction(TransactionRequest { tx_id: tx_b }).await.unwrap();
        assert_eq!(finished.status, TxStatus::Committed);

        let row = c.get_record(node(1), id).await.unwrap().unwrap();
        assert_eq!(row.amount, 115.0);
        assert_eq!(row.version, 3);
    }

    #[tokio::test]
    async fn test_crash_toggle_does_not_wait_for_open_writers() {
        let (_dir, c) = cluster(|_| {}).await;
        let credit = c.insert_record(insert(2, "Credit", 10.0)).await.unwrap();
        let vyber = c.insert_record(insert(1, "VYBER", 10.0)).await.unwrap();

        // Open writers on nodes 1 and 2 hold their files' writer locks.
        let tx_hub = start(&c, 1, "READ COMMITTED").await;
        c.update_record(UpdateRecordRequest { tx_id: tx_hub.clone(), record_id: vyber.trans_id, amount_delta: 1.0, balance_delta: 0.0 })
            .await
            .unwrap();
        let tx = start(&c, 2, "READ COMMITTED").await;
        c.update_record(UpdateRecordRequest { tx_id: tx.clone(), record_id: credit.trans_id, amount_delta: 1.0, balance_delta: 0.0 })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), c.set_node_online(node(2), false))
            .await
            .expect("status toggle blocked behind an open transaction")
            .unwrap();
        assert_eq!(c.get_all_statuses().await.get(&node(2)), Some(&false));

        let err = c.read_record(RecordRequest { tx_id: tx.clone(), record_id: credit.trans_id }).await.unwrap_err();
        assert!(matches!(err, Error::Offline(_)));
        assert_eq!(c.transaction(&tx).unwrap().status, TxStatus::RolledBack);

        c.commit_transaction(TransactionRequest { tx_id: tx_hub }).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_limit_applies_lowest_ids_first() {
        let (_dir, c) = cluster(|_| {}).await;
        for i in 0..10 {
            c.insert_record(insert(3, "Debit (Withdrawal)", i as f64)).await.unwrap();
        }

        let summary = c.run_replication_once(drain(3, 1, 5)).await.unwrap();
        assert_eq!(summary.requested, 5);
        let ids: Vec<i64> = summary.results.iter().map(|r| r.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(summary.results.iter().all(|r| r.status == DeliveryStatus::Applied));
        assert_eq!(
            c.outbox_backlog().await.unwrap(),
            vec![Backlog { source_node_id: node(3), target_node_id: node(1), pending: 5 }]
        );

        let err = c.run_replication_once(drain(3, 1, 0)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_idle_transaction_times_out() {
        let (_dir, c) = cluster(|config| {
            config.transactions.idle_timeout_ms = 100;
            config.transactions.sweep_interval = Duration::from_millis(20);
        })
        .await;
        let mut events = c.subscribe();
        let background = c.start_background();
        assert_eq!(background.len(), 1);

        let tx = start(&c, 1, "READ COMMITTED").await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(c.transaction(&tx).unwrap().status, TxStatus::TimeoutRolledBack);
        let listed = c.list_transactions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, TxStatus::TimeoutRolledBack);

        assert!(matches!(events.recv().await.unwrap(), TransactionEvent::Started { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            TransactionEvent::Finished { tx_id: tx.clone(), node_id: node(1), status: TxStatus::TimeoutRolledBack }
        );

        let err = c.commit_transaction(TransactionRequest { tx_id: tx }).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        background.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_replays_pending_entries() {
        let (_dir, c) = cluster(|config| config.replication.enabled = true).await;

        c.set_node_online(node(1), false).await.unwrap();
        let record = c.insert_record(insert(2, "Credit", 75.0)).await.unwrap();
        assert!(c.get_record(node(1), record.trans_id).await.unwrap().is_none());
        assert_eq!(c.outbox_backlog().await.unwrap().len(), 1);
        assert!(c.replication_metrics().skipped >= 1);

        c.set_node_online(node(1), true).await.unwrap();
        assert!(c.get_record(node(1), record.trans_id).await.unwrap().is_some());
        assert!(c.outbox_backlog().await.unwrap().is_empty());
        assert_eq!(c.get_all_statuses().await.values().filter(|online| **online).count(), 3);
    }

    #[tokio::test]
    async fn test_commit_triggers_replication() {
        let (_dir, c) = cluster(|config| config.replication.enabled = true).await;
        let record = c.insert_record(insert(3, "VYBER", 40.0)).await.unwrap();
        assert!(c.get_record(node(1), record.trans_id).await.unwrap().is_some());

        let tx = start(&c, 3, "READ COMMITTED").await;
        c.update_record(UpdateRecordRequest { tx_id: tx.clone(), record_id: record.trans_id, amount_delta: 2.0, balance_delta: 0.0 })
            .await
            .unwrap();
        c.commit_transaction(TransactionRequest { tx_id: tx }).await.unwrap();

        let on_hub = c.get_record(node(1), record.trans_id).await.unwrap().unwrap();
        assert_eq!(on_hub.amount, 42.0);
        assert_eq!(on_hub.last_updated_by_node, node(3));
    }

    #[tokio::test]
    async fn test_background_shutdown() {
        let (_dir, c) = cluster(|config| config.replication.enabled = true).await;
        let background = c.start_background();
        assert_eq!(background.len(), 2);
        background.shutdown().await;
    }
}
