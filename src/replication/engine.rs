use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::metrics::{MetricsCollector, ReplicationMetrics};
use super::outbox::{self, OutboxEntry, QueueParams};
use super::{DeliveryOutcome, DeliveryStatus, DrainSummary, OpType};
use crate::cluster::{NodeId, NodeRegistry, Router};
use crate::config::ReplicationConfig;
use crate::database::records::{self, Record};
use crate::database::{IsolationLevel, Session, Store};
use crate::error::{Error, Result};

/// What a successful apply did on the target
enum Applied {
    Fresh { fanout: usize },
    Duplicate,
}

/// Delivers outbox entries from their source node to their target node.
///
/// Each entry is applied in its own local transaction on the target, which
/// also records the entry in the target's ledger. Only after that commits is
/// the entry flagged applied on the source. A failure leaves the entry
/// pending; the ledger turns a later retry of an already-landed entry into a
/// no-op.
pub struct ReplicationEngine {
    /// Engine settings
    config: ReplicationConfig,
    /// Store of every node
    stores: BTreeMap<NodeId, Arc<dyn Store>>,
    /// Liveness registry consulted before each delivery
    registry: Arc<NodeRegistry>,
    /// Routing rules, also used for hub fan-out
    router: Router,
    /// Delivery counters
    metrics: MetricsCollector,
    /// Held while an automatic sweep runs
    sweep_lock: Mutex<()>,
}

impl ReplicationEngine {
    /// Create a new replication engine
    pub fn new(
        config: ReplicationConfig,
        stores: BTreeMap<NodeId, Arc<dyn Store>>,
        registry: Arc<NodeRegistry>,
        router: Router,
    ) -> Self {
        Self {
            config,
            stores,
            registry,
            router,
            metrics: MetricsCollector::new(),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Engine settings
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Delivery counters since start-up
    pub fn metrics(&self) -> ReplicationMetrics {
        self.metrics.snapshot()
    }

    fn store(&self, node: NodeId) -> Result<&Arc<dyn Store>> {
        self.stores
            .get(&node)
            .ok_or_else(|| Error::validation(format!("unknown node id {}", node)))
    }

    /// Applies up to `limit` of the oldest pending entries from `source`'s
    /// outbox toward `target`, in ascending id order.
    pub async fn drain_once(&self, source: NodeId, target: NodeId, limit: usize) -> Result<DrainSummary> {
        let store = self.store(source)?;
        self.store(target)?;
        if source == target {
            return Err(Error::validation(format!("cannot replicate node {} to itself", source)));
        }

        let entries = outbox::pending(store.as_ref(), target, limit)
            .await
            .map_err(|e| Error::replication(format!("reading outbox of node {}: {}", source, e)))?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in &entries {
            results.push(self.deliver(entry, source, target).await);
        }

        let summary = DrainSummary {
            source_node_id: source,
            target_node_id: target,
            requested: entries.len(),
            results,
        };
        self.metrics.record_batch();
        if summary.requested > 0 {
            debug!(
                source = %source,
                target = %target,
                requested = summary.requested,
                applied = summary.applied(),
                "drained outbox"
            );
        }
        Ok(summary)
    }

    /// Delivers one entry and reports the outcome. Never fails; errors are
    /// folded into the outcome and the entry stays pending.
    pub async fn deliver(&self, entry: &OutboxEntry, source: NodeId, target: NodeId) -> DeliveryOutcome {
        let mut retryable = true;
        let mut outcome = DeliveryOutcome {
            id: entry.id,
            status: DeliveryStatus::Applied,
            op_type: entry.op_type,
            fanout: 0,
            detail: None,
        };

        if entry.applied {
            outcome.status = DeliveryStatus::AlreadyApplied;
        } else if entry.source_node != source || entry.target_node != target {
            outcome.status = DeliveryStatus::Failed;
            retryable = false;
            outcome.detail = Some(format!(
                "entry {} belongs to {} -> {}, not {} -> {}",
                entry.id, entry.source_node, entry.target_node, source, target
            ));
        } else if !self.registry.is_online(target).await {
            outcome.status = DeliveryStatus::Skipped;
            outcome.detail = Some(format!("target node {} is offline", target));
        } else {
            match self.apply(entry, source, target).await {
                Ok(Applied::Fresh { fanout }) => outcome.fanout = fanout,
                Ok(Applied::Duplicate) => outcome.status = DeliveryStatus::AlreadyApplied,
                Err(e) => {
                    outcome.status = DeliveryStatus::Failed;
                    retryable = e.is_retryable();
                    outcome.detail = Some(e.to_string());
                }
            }
        }

        match outcome.status {
            DeliveryStatus::Failed => warn!(
                entry = entry.id,
                source = %source,
                target = %target,
                retryable,
                error = outcome.detail.as_deref().unwrap_or_default(),
                "replication entry failed"
            ),
            DeliveryStatus::Skipped => debug!(entry = entry.id, target = %target, "target offline, entry kept"),
            _ => {}
        }
        self.metrics.record_outcome(&outcome);
        outcome
    }

    async fn apply(&self, entry: &OutboxEntry, source: NodeId, target: NodeId) -> Result<Applied> {
        let source_store = self.store(source)?;
        let target_store = self.store(target)?;

        let mut session = target_store.session().await?;
        session.begin(IsolationLevel::ReadCommitted).await?;

        let applied = match self.apply_in(session.as_mut(), entry, source, target).await {
            Ok(applied) => applied,
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    warn!(entry = entry.id, error = %rollback, "rollback after failed apply failed");
                }
                return Err(e);
            }
        };
        if let Err(e) = session.commit().await {
            if let Err(rollback) = session.rollback().await {
                warn!(entry = entry.id, error = %rollback, "rollback after failed commit failed");
            }
            return Err(e.into());
        }
        drop(session);

        outbox::mark_applied(source_store.as_ref(), entry.id)
            .await
            .map_err(|e| Error::replication(format!("applied on node {} but not marked on node {}: {}", target, source, e)))?;
        Ok(applied)
    }

    async fn apply_in(
        &self,
        session: &mut dyn Session,
        entry: &OutboxEntry,
        source: NodeId,
        target: NodeId,
    ) -> Result<Applied> {
        if outbox::ledger_contains(session, source, entry.id).await? {
            return Ok(Applied::Duplicate);
        }

        let topology = self.router.topology();
        let relay = topology.is_hub(target) && !topology.is_hub(source);

        // (type, amount, balance) of the row as it now stands on the target
        let mut landed: Option<(String, Option<f64>, Option<f64>)> = None;

        match entry.op_type {
            OpType::Insert => {
                let mut source_session = self.store(source)?.session().await?;
                match records::fetch(source_session.as_mut(), entry.trans_id).await? {
                    Some(row) => {
                        let record = Record { last_updated_by_node: source, ..row };
                        records::upsert(session, &record).await?;
                        landed = Some((record.record_type, Some(record.amount), Some(record.balance)));
                    }
                    None => {
                        warn!(entry = entry.id, trans_id = entry.trans_id, "inserted row no longer exists on source");
                    }
                }
            }
            OpType::Update => {
                let (amount, balance) = entry
                    .amount_after
                    .zip(entry.balance_after)
                    .ok_or_else(|| Error::replication(format!("entry {} has no after-image", entry.id)))?;
                if records::write_values(session, entry.trans_id, amount, balance, source).await? == 0 {
                    warn!(entry = entry.id, trans_id = entry.trans_id, target = %target, "update for missing row ignored");
                } else if relay {
                    if let Some(record_type) = records::fetch_type(session, entry.trans_id).await? {
                        landed = Some((record_type, Some(amount), Some(balance)));
                    }
                }
            }
            OpType::Delete => {
                if relay {
                    landed = records::fetch_type(session, entry.trans_id)
                        .await?
                        .map(|record_type| (record_type, None, None));
                }
                records::delete(session, entry.trans_id).await?;
            }
        }

        let mut fanout = 0;
        if let (true, Some((record_type, amount_after, balance_after))) = (relay, landed) {
            let params = QueueParams {
                source_node: target,
                trans_id: entry.trans_id,
                record_type,
                op_type: entry.op_type,
                amount_before: entry.amount_before,
                balance_before: entry.balance_before,
                amount_after,
                balance_after,
            };
            for next in self.router.fanout_targets(source, &params.record_type, self.config.relay_to_origin) {
                outbox::enqueue(session, next, &params).await?;
                fanout += 1;
            }
        }

        outbox::record_in_ledger(session, source, entry.id, entry.trans_id).await?;
        Ok(Applied::Fresh { fanout })
    }

    /// Runs one drain over every replication pair, unless a sweep is already
    /// running, in which case `None` is returned immediately.
    pub async fn run_auto_batch(&self) -> Option<Vec<DrainSummary>> {
        let _guard = match self.sweep_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("replication sweep already running");
                return None;
            }
        };

        let mut summaries = Vec::new();
        for (source, target) in self.router.topology().replication_pairs() {
            match self.drain_once(source, target, self.config.batch_limit).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(source = %source, target = %target, error = %e, "replication drain failed"),
            }
        }
        Some(summaries)
    }

    /// Best-effort sweep after a write, when automatic delivery is enabled.
    pub async fn trigger(&self, reason: &str) {
        if !self.config.enabled {
            return;
        }
        if let Some(summaries) = self.run_auto_batch().await {
            let applied: usize = summaries.iter().map(DrainSummary::applied).sum();
            debug!(reason, applied, "replication sweep finished");
        }
    }

    /// Spawns the periodic sweep. Returns `None` when automatic delivery is
    /// disabled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("automatic replication disabled");
            return None;
        }

        let engine = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(engine.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = engine.config.interval.as_millis() as u64, "replication worker started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.run_auto_batch().await;
                    }
                }
            }
            info!("replication worker stopped");
        }))
    }
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("config", &self.config)
            .field("nodes", &self.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}
