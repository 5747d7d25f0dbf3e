//! Fragmesh coordinates transactions and replicates writes across a small
//! fragmented relational store.
//!
//! One hub node holds every row; fragment nodes each own the rows of some
//! record types. Callers run explicit transactions against a single node
//! through the [`Coordinator`]. Every write records outbox entries in the
//! same local transaction, and the replication engine later delivers them to
//! the other nodes idempotently, surviving simulated node outages.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod replication;
pub mod transaction;

// Re-export common types
pub use cluster::{NodeId, NodeRegistry, NodeRole, Router, Topology};
pub use config::{ClusterConfig, NodeConfig, ReplicationConfig, TransactionConfig};
pub use coordinator::{BackgroundTasks, Coordinator};
pub use database::{DatabaseConfig, DatabaseType, IsolationLevel, NewRecord, Record};
pub use error::{Error, Result};
pub use replication::{DeliveryOutcome, DeliveryStatus, DrainSummary, OpType, ReplicationEngine};
pub use transaction::{TransactionManager, TxId, TxStatus};

/// Version of the Fragmesh library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
