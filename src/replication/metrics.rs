use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

use super::{DeliveryOutcome, DeliveryStatus};

/// Replication counters since start-up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    /// Drain passes run over a (source, target) pair
    pub batches: u64,
    /// Entries applied on their target
    pub applied: u64,
    /// Entries the target had already accepted
    pub duplicates: u64,
    /// Entries skipped because the target was offline
    pub skipped: u64,
    /// Entries whose delivery failed
    pub failed: u64,
    /// Follow-up entries queued by hub fan-out
    pub fanout_queued: u64,
}

/// Lock-free collector behind [`ReplicationMetrics`]
#[derive(Debug, Default)]
pub struct MetricsCollector {
    batches: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    fanout_queued: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one delivery
    pub fn record_outcome(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome.status {
            DeliveryStatus::Applied => &self.applied,
            DeliveryStatus::AlreadyApplied => &self.duplicates,
            DeliveryStatus::Skipped => &self.skipped,
            DeliveryStatus::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.fanout_queued.fetch_add(outcome.fanout as u64, Ordering::Relaxed);
    }

    /// Records a finished drain pass
    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> ReplicationMetrics {
        ReplicationMetrics {
            batches: self.batches.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fanout_queued: self.fanout_queued.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::OpType;

    fn outcome(status: DeliveryStatus, fanout: usize) -> DeliveryOutcome {
        DeliveryOutcome { id: 1, status, op_type: OpType::Update, fanout, detail: None }
    }

    #[test]
    fn test_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_outcome(&outcome(DeliveryStatus::Applied, 1));
        metrics.record_outcome(&outcome(DeliveryStatus::Applied, 0));
        metrics.record_outcome(&outcome(DeliveryStatus::Skipped, 0));
        metrics.record_outcome(&outcome(DeliveryStatus::Failed, 0));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.applied, 2);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.duplicates, 0);
        assert_eq!(snapshot.fanout_queued, 1);
    }
}
