//! Log-based replication between node stores.
//!
//! Every mutating write appends outbox entries (`replication_log`) in the
//! same local transaction. The [`ReplicationEngine`] later delivers them to
//! their target nodes, one local transaction per entry, and marks them
//! applied on the source. The target's own ledger makes repeated delivery a
//! no-op, so at-least-once delivery behaves as effectively-once.

use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::error::Error;

mod engine;
mod metrics;
pub mod outbox;

pub use engine::ReplicationEngine;
pub use metrics::{MetricsCollector, ReplicationMetrics};
pub use outbox::{OutboxEntry, QueueParams};

/// Kind of row mutation carried by an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    /// Row created
    Insert,
    /// Amount/balance changed
    Update,
    /// Row removed
    Delete,
}

impl OpType {
    /// Stored spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(OpType::Insert),
            "UPDATE" => Ok(OpType::Update),
            "DELETE" => Ok(OpType::Delete),
            other => Err(Error::replication(format!("unknown op_type {:?} in replication_log", other))),
        }
    }
}

/// Result of delivering one outbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Applied on the target and marked applied on the source
    Applied,
    /// The target had already accepted this entry; nothing changed
    AlreadyApplied,
    /// Target offline; the entry stays pending
    Skipped,
    /// Delivery failed; the entry stays pending
    #[serde(rename = "error")]
    Failed,
}

/// Per-entry delivery report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Outbox entry id
    pub id: i64,
    /// What happened
    pub status: DeliveryStatus,
    /// Operation carried by the entry
    pub op_type: OpType,
    /// Follow-up entries queued on the hub toward sibling fragments
    pub fanout: usize,
    /// Skip reason or error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DeliveryOutcome {
    /// Whether the target now reflects the entry
    pub fn is_applied(&self) -> bool {
        matches!(self.status, DeliveryStatus::Applied | DeliveryStatus::AlreadyApplied)
    }
}

/// Result of one drain pass over a (source, target) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainSummary {
    /// Node whose outbox was drained
    pub source_node_id: NodeId,
    /// Node the entries were delivered to
    pub target_node_id: NodeId,
    /// Number of pending entries picked up
    pub requested: usize,
    /// Outcome per entry, in ascending id order
    pub results: Vec<DeliveryOutcome>,
}

impl DrainSummary {
    /// Number of entries that reached the target
    pub fn applied(&self) -> usize {
        self.results.iter().filter(|r| r.is_applied()).count()
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
