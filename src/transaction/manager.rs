use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    FinishedTransaction, OperationResult, ReadResult, StartedTransaction, TransactionEvent, TxId, TxInfo,
    TxOperation, TxStatus, TxSummary,
};
use crate::cluster::{NodeId, NodeRegistry, NodeRole, Router};
use crate::config::TransactionConfig;
use crate::database::records::{self, NewRecord, Record};
use crate::database::{IsolationLevel, Session, Store};
use crate::error::{Error, Result};
use crate::replication::outbox::{self, QueueParams};
use crate::replication::{OpType, ReplicationEngine};

/// Session slot of a transaction; emptied when the session is released
type SessionSlot = Option<Box<dyn Session>>;

/// An active transaction: bookkeeping plus the exclusively held session.
///
/// `info` is only ever locked briefly; `session` is held for the duration of
/// an operation, including any wait on a row lock.
struct TxHandle {
    info: Mutex<TxInfo>,
    session: tokio::sync::Mutex<SessionSlot>,
}

/// Registry and lifecycle of logical transactions across all nodes.
pub struct TransactionManager {
    /// Manager settings
    config: TransactionConfig,
    /// Store of every node
    stores: BTreeMap<NodeId, Arc<dyn Store>>,
    /// Liveness registry checked on every operation
    registry: Arc<NodeRegistry>,
    /// Routing rules for outbox entries
    router: Router,
    /// Triggered after every commit and insert
    replication: Arc<ReplicationEngine>,
    /// Active transactions
    active: DashMap<TxId, Arc<TxHandle>>,
    /// Recently finished transactions, oldest first
    history: Mutex<VecDeque<TxInfo>>,
    /// Lifecycle event channel
    events: broadcast::Sender<TransactionEvent>,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(
        config: TransactionConfig,
        stores: BTreeMap<NodeId, Arc<dyn Store>>,
        registry: Arc<NodeRegistry>,
        router: Router,
        replication: Arc<ReplicationEngine>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            stores,
            registry,
            router,
            replication,
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.events.subscribe()
    }

    /// Number of active transactions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn store(&self, node: NodeId) -> Result<&Arc<dyn Store>> {
        self.stores
            .get(&node)
            .ok_or_else(|| Error::validation(format!("unknown node id {}", node)))
    }

    fn handle(&self, tx_id: &TxId) -> Result<Arc<TxHandle>> {
        self.active
            .get(tx_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("transaction {} not found or already finished", tx_id)))
    }

    /// Opens a transaction on `node` at the given isolation level.
    pub async fn start(
        &self,
        node: NodeId,
        isolation: IsolationLevel,
        description: Option<String>,
    ) -> Result<StartedTransaction> {
        let store = self.store(node)?;
        if !self.registry.is_online(node).await {
            return Err(Error::offline(format!(
                "node {} is offline; cannot start a transaction on it",
                node
            )));
        }

        let mut session = store.session().await?;
        session.begin(isolation).await?;

        let now = Utc::now();
        let info = TxInfo {
            tx_id: TxId::generate(),
            node_id: node,
            isolation_level: isolation,
            description,
            status: TxStatus::Active,
            started_at: now,
            last_activity_at: now,
            finished_at: None,
            operations: Vec::new(),
        };
        let started = StartedTransaction {
            tx_id: info.tx_id.clone(),
            node_id: node,
            isolation_level: isolation,
            description: info.description.clone(),
            started_at: now,
        };

        self.active.insert(
            started.tx_id.clone(),
            Arc::new(TxHandle {
                info: Mutex::new(info),
                session: tokio::sync::Mutex::new(Some(session)),
            }),
        );

        info!(tx_id = %started.tx_id, node = %node, isolation = %isolation, "transaction started");
        let _ = self.events.send(TransactionEvent::Started { tx_id: started.tx_id.clone(), node_id: node });
        Ok(started)
    }

    /// Reads a row inside the transaction.
    pub async fn read(&self, tx_id: &TxId, trans_id: i64) -> Result<ReadResult> {
        let handle = self.handle(tx_id)?;
        let mut slot = handle.session.lock().await;
        let (node, isolation) = self.require_active(&handle, &mut slot).await?;

        let result = match slot.as_mut() {
            Some(session) => records::fetch(session.as_mut(), trans_id).await.map_err(Error::from),
            None => Err(Error::internal(format!("transaction {} has no session", tx_id))),
        };
        let row = match result {
            Ok(row) => row,
            Err(e) => return Err(self.fail(&handle, &mut slot, "read", e).await),
        };

        self.record_operation(&handle, TxOperation::Read {
            trans_id,
            at: Utc::now(),
            row_snapshot: row.clone(),
        });
        Ok(ReadResult { row, node_id: node, isolation_level: isolation })
    }

    /// Adds deltas to a row's amount and balance under its write lock and
    /// queues the change for replication.
    pub async fn update(
        &self,
        tx_id: &TxId,
        trans_id: i64,
        amount_delta: f64,
        balance_delta: f64,
    ) -> Result<OperationResult> {
        let handle = self.handle(tx_id)?;
        let mut slot = handle.session.lock().await;
        let (node, isolation) = self.require_active(&handle, &mut slot).await?;

        let result = match slot.as_mut() {
            Some(session) => self.apply_update(session.as_mut(), node, trans_id, amount_delta, balance_delta).await,
            None => Err(Error::internal(format!("transaction {} has no session", tx_id))),
        };
        let operation = match result {
            Ok(operation) => operation,
            Err(e) => return Err(self.fail(&handle, &mut slot, "update", e).await),
        };

        self.record_operation(&handle, operation.clone());
        debug!(tx_id = %tx_id, trans_id, "row updated");
        Ok(OperationResult { node_id: node, isolation_level: isolation, operation })
    }

    async fn apply_update(
        &self,
        session: &mut dyn Session,
        node: NodeId,
        trans_id: i64,
        amount_delta: f64,
        balance_delta: f64,
    ) -> Result<TxOperation> {
        let current = records::fetch_for_update(session, trans_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("trans_id {} not found on node {}", trans_id, node)))?;

        let amount_after = current.amount + amount_delta;
        let balance_after = current.balance + balance_delta;
        records::write_values(session, trans_id, amount_after, balance_after, node).await?;

        outbox::queue_for_row(session, &self.router, &QueueParams {
            source_node: node,
            trans_id,
            record_type: current.record_type,
            op_type: OpType::Update,
            amount_before: Some(current.amount),
            balance_before: Some(current.balance),
            amount_after: Some(amount_after),
            balance_after: Some(balance_after),
        })
        .await?;

        Ok(TxOperation::Update {
            trans_id,
            at: Utc::now(),
            amount_before: current.amount,
            balance_before: current.balance,
            amount_after,
            balance_after,
        })
    }

    /// Deletes a row under its write lock and queues the removal.
    pub async fn delete(&self, tx_id: &TxId, trans_id: i64) -> Result<OperationResult> {
        let handle = self.handle(tx_id)?;
        let mut slot = handle.session.lock().await;
        let (node, isolation) = self.require_active(&handle, &mut slot).await?;

        let result = match slot.as_mut() {
            Some(session) => self.apply_delete(session.as_mut(), node, trans_id).await,
            None => Err(Error::internal(format!("transaction {} has no session", tx_id))),
        };
        let operation = match result {
            Ok(operation) => operation,
            Err(e) => return Err(self.fail(&handle, &mut slot, "delete", e).await),
        };

        self.record_operation(&handle, operation.clone());
        debug!(tx_id = %tx_id, trans_id, "row deleted");
        Ok(OperationResult { node_id: node, isolation_level: isolation, operation })
    }

    async fn apply_delete(&self, session: &mut dyn Session, node: NodeId, trans_id: i64) -> Result<TxOperation> {
        let current = records::fetch_for_update(session, trans_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("trans_id {} not found on node {}", trans_id, node)))?;

        records::delete(session, trans_id).await?;

        outbox::queue_for_row(session, &self.router, &QueueParams {
            source_node: node,
            trans_id,
            record_type: current.record_type.clone(),
            op_type: OpType::Delete,
            amount_before: Some(current.amount),
            balance_before: Some(current.balance),
            amount_after: None,
            balance_after: None,
        })
        .await?;

        Ok(TxOperation::Delete {
            trans_id,
            at: Utc::now(),
            amount_before: current.amount,
            balance_before: current.balance,
            row_snapshot: current,
        })
    }

    /// Commits, releases the session, then kicks off replication.
    pub async fn commit(&self, tx_id: &TxId) -> Result<FinishedTransaction> {
        let handle = self.handle(tx_id)?;
        let mut slot = handle.session.lock().await;
        self.require_active(&handle, &mut slot).await?;

        let result = match slot.as_mut() {
            Some(session) => session.commit().await.map_err(Error::from),
            None => Err(Error::internal(format!("transaction {} has no session", tx_id))),
        };
        if let Err(e) = result {
            return Err(self.fail(&handle, &mut slot, "commit", e).await);
        }

        let info = self.finish(&handle, &mut slot, TxStatus::Committed).await;
        drop(slot);

        self.replication.trigger("commit").await;
        Ok(info.finished())
    }

    /// Rolls back and releases the session.
    pub async fn rollback(&self, tx_id: &TxId) -> Result<FinishedTransaction> {
        let handle = self.handle(tx_id)?;
        let mut slot = handle.session.lock().await;
        self.require_active(&handle, &mut slot).await?;

        let info = self.finish(&handle, &mut slot, TxStatus::RolledBack).await;
        Ok(info.finished())
    }

    /// Inserts a new row on `node` in its own short local transaction.
    ///
    /// Fragments only accept the types they own. The row gets a fresh
    /// trans_id, version 1, and INSERT entries toward its router targets.
    pub async fn insert(&self, node: NodeId, new: NewRecord) -> Result<Record> {
        let store = self.store(node)?;
        if !self.registry.is_online(node).await {
            return Err(Error::offline(format!("node {} is offline; cannot insert on it", node)));
        }

        let record_type = new.record_type.trim().to_string();
        if record_type.is_empty() {
            return Err(Error::validation("record type is required"));
        }
        if let Some(spec) = self.router.topology().node(node) {
            if spec.role == NodeRole::Fragment && !spec.owns(&record_type) {
                return Err(Error::validation(format!(
                    "node {} only accepts types {:?}, got {:?}",
                    node, spec.owned_types, record_type
                )));
            }
        }

        let mut session = store.session().await?;
        session.begin(IsolationLevel::ReadCommitted).await?;

        let result = self.insert_in(session.as_mut(), node, NewRecord { record_type, ..new }).await;
        let result = match result {
            Ok(record) => session.commit().await.map(|_| record).map_err(Error::from),
            Err(e) => Err(e),
        };
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    error!(node = %node, error = %rollback, "failed to roll back insert");
                }
                return Err(e);
            }
        };
        drop(session);

        info!(node = %node, trans_id = record.trans_id, record_type = %record.record_type, "row inserted");
        self.replication.trigger("insert").await;
        Ok(record)
    }

    async fn insert_in(&self, session: &mut dyn Session, node: NodeId, new: NewRecord) -> Result<Record> {
        records::lock_for_insert(session).await?;
        let node_count = u32::try_from(self.router.topology().len()).unwrap_or(u32::MAX);
        let trans_id = records::next_trans_id(session, node, node_count).await?;

        let record = Record {
            trans_id,
            account_id: new.account_id,
            date: new.date,
            record_type: new.record_type,
            amount: new.amount,
            balance: new.balance,
            last_updated_by_node: node,
            version: 1,
        };
        records::insert(session, &record).await?;

        outbox::queue_for_row(session, &self.router, &QueueParams {
            source_node: node,
            trans_id,
            record_type: record.record_type.clone(),
            op_type: OpType::Insert,
            amount_before: None,
            balance_before: None,
            amount_after: Some(record.amount),
            balance_after: Some(record.balance),
        })
        .await?;
        Ok(record)
    }

    /// Active transactions (oldest first) followed by recently finished ones
    /// (newest first).
    pub fn list(&self) -> Vec<TxSummary> {
        let mut summaries: Vec<TxSummary> = self.active
            .iter()
            .map(|entry| entry.value().info.lock().summary())
            .collect();
        summaries.sort_by_key(|s| s.started_at);

        let history = self.history.lock();
        summaries.extend(history.iter().rev().map(TxInfo::summary));
        summaries
    }

    /// Full state of an active or recently finished transaction
    pub fn get(&self, tx_id: &TxId) -> Option<TxInfo> {
        if let Some(entry) = self.active.get(tx_id) {
            return Some(entry.value().info.lock().clone());
        }
        self.history.lock().iter().rev().find(|info| &info.tx_id == tx_id).cloned()
    }

    /// Rolls back every active transaction idle for at least the configured
    /// timeout. Transactions with an operation in flight are left alone.
    pub async fn sweep_idle(&self) -> Vec<TxId> {
        let timeout = match self.config.idle_timeout() {
            Some(timeout) => timeout,
            None => return Vec::new(),
        };
        let now = Utc::now();
        let is_idle = |info: &TxInfo| {
            info.status == TxStatus::Active
                && (now - info.last_activity_at)
                    .to_std()
                    .map(|idle| idle >= timeout)
                    .unwrap_or(false)
        };

        let candidates: Vec<Arc<TxHandle>> = self.active
            .iter()
            .filter(|entry| is_idle(&*entry.value().info.lock()))
            .map(|entry| entry.value().clone())
            .collect();

        let mut expired = Vec::new();
        for handle in candidates {
            let mut slot = match handle.session.try_lock() {
                Ok(slot) => slot,
                Err(_) => continue,
            };
            if !is_idle(&*handle.info.lock()) {
                continue;
            }
            let info = self.finish(&handle, &mut slot, TxStatus::TimeoutRolledBack).await;
            warn!(tx_id = %info.tx_id, node = %info.node_id, "transaction rolled back after idle timeout");
            expired.push(info.tx_id);
        }
        expired
    }

    /// Spawns the idle sweeper. Returns `None` when the idle timeout is
    /// disabled.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let timeout = self.config.idle_timeout()?;
        let manager = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                idle_timeout_ms = timeout.as_millis() as u64,
                sweep_interval_ms = manager.config.sweep_interval.as_millis() as u64,
                "transaction sweeper started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_idle().await;
                    }
                }
            }
            info!("transaction sweeper stopped");
        }))
    }

    /// Checks the handle is usable. If its node went offline the transaction
    /// is rolled back and `Offline` returned.
    async fn require_active(&self, handle: &TxHandle, slot: &mut SessionSlot) -> Result<(NodeId, IsolationLevel)> {
        let (tx_id, node, isolation, status) = {
            let info = handle.info.lock();
            (info.tx_id.clone(), info.node_id, info.isolation_level, info.status)
        };
        if status != TxStatus::Active || slot.is_none() {
            return Err(Error::not_found(format!(
                "transaction {} is not active (status: {})",
                tx_id, status
            )));
        }

        if !self.registry.is_online(node).await {
            self.finish(handle, slot, TxStatus::RolledBack).await;
            return Err(Error::offline(format!(
                "node {} is offline; transaction {} was rolled back",
                node, tx_id
            )));
        }

        handle.info.lock().last_activity_at = Utc::now();
        Ok((node, isolation))
    }

    fn record_operation(&self, handle: &TxHandle, operation: TxOperation) {
        let mut info = handle.info.lock();
        info.last_activity_at = Utc::now();
        info.operations.push(operation);
    }

    /// Finalizes after a failed operation and hands back the error.
    async fn fail(&self, handle: &TxHandle, slot: &mut SessionSlot, context: &str, err: Error) -> Error {
        let tx_id = handle.info.lock().tx_id.clone();
        warn!(tx_id = %tx_id, context, retryable = err.is_retryable(), error = %err, "transaction failed, rolling back");
        self.finish(handle, slot, TxStatus::RolledBack).await;
        err
    }

    /// Releases the session (rolling back unless committed), records the
    /// terminal status and moves the transaction to history.
    async fn finish(&self, handle: &TxHandle, slot: &mut SessionSlot, status: TxStatus) -> TxInfo {
        if let Some(mut session) = slot.take() {
            if status != TxStatus::Committed && session.in_transaction() {
                if let Err(e) = session.rollback().await {
                    let tx_id = handle.info.lock().tx_id.clone();
                    error!(tx_id = %tx_id, error = %e, "rollback failed while finishing transaction");
                }
            }
        }

        let info = {
            let mut info = handle.info.lock();
            info.status = status;
            info.finished_at = Some(Utc::now());
            info.clone()
        };

        self.active.remove(&info.tx_id);
        {
            let mut history = self.history.lock();
            history.push_back(info.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        info!(tx_id = %info.tx_id, node = %info.node_id, status = %status, "transaction finished");
        let _ = self.events.send(TransactionEvent::Finished {
            tx_id: info.tx_id.clone(),
            node_id: info.node_id,
            status,
        });
        info
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("active", &self.active.len())
            .finish()
    }
}
