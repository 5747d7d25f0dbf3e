//! Logical transactions bound to an exclusive session on one node.
//!
//! Lifecycle: `active → committed | rolledback | timeout_rolledback`. Terminal
//! states are final and a transaction id is never reused.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::NodeId;
use crate::database::{IsolationLevel, Record};

mod manager;

pub use manager::TransactionManager;

/// Opaque transaction id, `tx-<uuid>`
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    /// Mints a fresh, never reused id
    pub fn generate() -> Self {
        Self(format!("tx-{}", Uuid::new_v4()))
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    /// Open; operations may be issued
    #[serde(rename = "active")]
    Active,
    /// Committed by the caller
    #[serde(rename = "committed")]
    Committed,
    /// Rolled back by the caller, after an error, or because its node went offline
    #[serde(rename = "rolledback")]
    RolledBack,
    /// Rolled back by the idle sweeper
    #[serde(rename = "timeout_rolledback")]
    TimeoutRolledBack,
}

impl TxStatus {
    /// Whether no further operation may reference the transaction
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Active)
    }

    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Active => "active",
            TxStatus::Committed => "committed",
            TxStatus::RolledBack => "rolledback",
            TxStatus::TimeoutRolledBack => "timeout_rolledback",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step performed inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE", rename_all_fields = "camelCase")]
pub enum TxOperation {
    /// Plain read
    Read {
        /// Row read
        trans_id: i64,
        /// When
        at: DateTime<Utc>,
        /// Row as seen, if present
        row_snapshot: Option<Record>,
    },
    /// Delta update
    Update {
        /// Row written
        trans_id: i64,
        /// When
        at: DateTime<Utc>,
        /// Amount before
        amount_before: f64,
        /// Balance before
        balance_before: f64,
        /// Amount after
        amount_after: f64,
        /// Balance after
        balance_after: f64,
    },
    /// Row removal
    Delete {
        /// Row removed
        trans_id: i64,
        /// When
        at: DateTime<Utc>,
        /// Amount before
        amount_before: f64,
        /// Balance before
        balance_before: f64,
        /// Row as it was
        row_snapshot: Record,
    },
}

impl TxOperation {
    /// Row the operation touched
    pub fn trans_id(&self) -> i64 {
        match self {
            TxOperation::Read { trans_id, .. }
            | TxOperation::Update { trans_id, .. }
            | TxOperation::Delete { trans_id, .. } => *trans_id,
        }
    }
}

/// Full state of a logical transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    /// Transaction id
    pub tx_id: TxId,
    /// Node the session lives on
    pub node_id: NodeId,
    /// Isolation level of the session
    pub isolation_level: IsolationLevel,
    /// Caller-supplied label
    pub description: Option<String>,
    /// Current status
    pub status: TxStatus,
    /// When it started
    pub started_at: DateTime<Utc>,
    /// Last time an operation touched it
    pub last_activity_at: DateTime<Utc>,
    /// When it reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Operations performed, in order
    pub operations: Vec<TxOperation>,
}

impl TxInfo {
    /// Listing view
    pub fn summary(&self) -> TxSummary {
        TxSummary {
            tx_id: self.tx_id.clone(),
            node_id: self.node_id,
            isolation_level: self.isolation_level,
            description: self.description.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            operation_count: self.operations.len(),
        }
    }

    fn finished(&self) -> FinishedTransaction {
        FinishedTransaction {
            tx_id: self.tx_id.clone(),
            node_id: self.node_id,
            isolation_level: self.isolation_level,
            status: self.status,
            finished_at: self.finished_at.unwrap_or(self.last_activity_at),
        }
    }
}

/// Returned by start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedTransaction {
    /// New transaction id
    pub tx_id: TxId,
    /// Node the session lives on
    pub node_id: NodeId,
    /// Isolation level in effect
    pub isolation_level: IsolationLevel,
    /// Caller-supplied label
    pub description: Option<String>,
    /// Start time
    pub started_at: DateTime<Utc>,
}

/// Returned by read
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    /// Row, if present
    pub row: Option<Record>,
    /// Node read from
    pub node_id: NodeId,
    /// Isolation level in effect
    pub isolation_level: IsolationLevel,
}

/// Returned by update and delete
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Node written on
    pub node_id: NodeId,
    /// Isolation level in effect
    pub isolation_level: IsolationLevel,
    /// What was done
    pub operation: TxOperation,
}

/// Returned by commit and rollback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedTransaction {
    /// Transaction id
    pub tx_id: TxId,
    /// Node the session lived on
    pub node_id: NodeId,
    /// Isolation level it ran at
    pub isolation_level: IsolationLevel,
    /// Terminal status
    pub status: TxStatus,
    /// When it finished
    pub finished_at: DateTime<Utc>,
}

/// One row of the transaction listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxSummary {
    /// Transaction id
    pub tx_id: TxId,
    /// Node
    pub node_id: NodeId,
    /// Isolation level
    pub isolation_level: IsolationLevel,
    /// Caller-supplied label
    pub description: Option<String>,
    /// Status
    pub status: TxStatus,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Finish time, once terminal
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of operations performed
    pub operation_count: usize,
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    /// A transaction was opened
    Started {
        /// Transaction id
        tx_id: TxId,
        /// Node
        node_id: NodeId,
    },
    /// A transaction reached a terminal status
    Finished {
        /// Transaction id
        tx_id: TxId,
        /// Node
        node_id: NodeId,
        /// Terminal status
        status: TxStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_ids_are_unique() {
        let a = TxId::generate();
        let b = TxId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tx-"));
    }

    #[test]
    fn test_status_spelling() {
        assert_eq!(serde_json::to_string(&TxStatus::RolledBack).unwrap(), "\"rolledback\"");
        assert_eq!(TxStatus::TimeoutRolledBack.to_string(), "timeout_rolledback");
        assert!(TxStatus::Committed.is_terminal());
        assert!(!TxStatus::Active.is_terminal());
    }

    #[test]
    fn test_operation_serialization() {
        let op = TxOperation::Update {
            trans_id: 7,
            at: Utc::now(),
            amount_before: 10.0,
            balance_before: 100.0,
            amount_after: 15.0,
            balance_after: 105.0,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "UPDATE");
        assert_eq!(json["transId"], 7);
        assert_eq!(json["amountAfter"], 15.0);
        assert_eq!(op.trans_id(), 7);
    }
}
