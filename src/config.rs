//! Cluster configuration.
//!
//! A [`ClusterConfig`] describes the nodes, where each node's store lives,
//! and the tuning knobs of the transaction manager and the replication
//! engine. It can be built in code, parsed from JSON, and adjusted from the
//! environment.

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::cluster::{NodeId, NodeRole, NodeSpec, Topology};
use crate::database::DatabaseConfig;
use crate::error::{Error, Result};

/// Serializes a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes the duration as a millisecond count
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Reads a millisecond count
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Transaction manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Idle time after which an active transaction is rolled back; zero or
    /// negative disables the sweeper
    pub idle_timeout_ms: i64,

    /// How often the sweeper looks for idle transactions
    #[serde(with = "duration_ms", rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,

    /// Number of finished transactions kept for listing
    pub history_limit: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5_000,
            sweep_interval: Duration::from_millis(500),
            history_limit: 256,
        }
    }
}

impl TransactionConfig {
    /// Idle timeout, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        u64::try_from(self.idle_timeout_ms)
            .ok()
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}

/// Replication engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Whether delivery runs on its own: on a timer, after every commit or
    /// insert, and when a node comes back online. Manual drains always work.
    pub enabled: bool,

    /// Period of the background drain
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,

    /// Entries picked up per (source, target) pair per pass
    pub batch_limit: usize,

    /// Whether the hub also relays a fragment's write back to that fragment
    pub relay_to_origin: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(1_000),
            batch_limit: 100,
            relay_to_origin: false,
        }
    }
}

/// One node and its store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id
    pub id: NodeId,
    /// Hub or fragment
    pub role: NodeRole,
    /// Record types this fragment owns
    #[serde(default)]
    pub owned_types: Vec<String>,
    /// Where the node's rows live
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Full cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Nodes of the cluster
    pub nodes: Vec<NodeConfig>,
    /// Transaction manager settings
    pub transactions: TransactionConfig,
    /// Replication settings
    pub replication: ReplicationConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::local(".")
    }
}

impl ClusterConfig {
    /// The default three-node topology with one SQLite file per node under `dir`.
    pub fn local(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let nodes = Topology::default_three_node()
            .nodes()
            .iter()
            .map(|spec| NodeConfig {
                id: spec.id,
                role: spec.role,
                owned_types: spec.owned_types.clone(),
                database: DatabaseConfig::new_sqlite(
                    dir.join(format!("node{}.db", spec.id)).to_string_lossy(),
                ),
            })
            .collect();

        Self {
            nodes,
            transactions: TransactionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }

    /// Parses and validates a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Applies `TX_IDLE_TIMEOUT_MS`, `TX_SWEEP_INTERVAL_MS`,
    /// `AUTO_REPLICATION_ENABLED`, `AUTO_REPLICATION_INTERVAL_MS` and
    /// `AUTO_REPLICATION_LIMIT` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TX_IDLE_TIMEOUT_MS") {
            self.transactions.idle_timeout_ms = parse_number("TX_IDLE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("TX_SWEEP_INTERVAL_MS") {
            self.transactions.sweep_interval = Duration::from_millis(parse_number("TX_SWEEP_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("AUTO_REPLICATION_ENABLED") {
            self.replication.enabled = !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            );
        }
        if let Some(v) = lookup("AUTO_REPLICATION_INTERVAL_MS") {
            self.replication.interval = Duration::from_millis(parse_number("AUTO_REPLICATION_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("AUTO_REPLICATION_LIMIT") {
            self.replication.batch_limit = parse_number("AUTO_REPLICATION_LIMIT", &v)?;
        }
        self.validate()
    }

    /// The node topology described by this configuration
    pub fn topology(&self) -> Result<Topology> {
        Topology::new(
            self.nodes
                .iter()
                .map(|n| NodeSpec { id: n.id, role: n.role, owned_types: n.owned_types.clone() })
                .collect(),
        )
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("at least one node is required".into()));
        }
        self.topology()?;
        for node in &self.nodes {
            node.database
                .validate()
                .map_err(|e| Error::Config(format!("node {}: {}", node.id, e)))?;
        }
        if self.transactions.sweep_interval.is_zero() {
            return Err(Error::Config("transaction sweep interval must be positive".into()));
        }
        if self.replication.interval.is_zero() {
            return Err(Error::Config("replication interval must be positive".into()));
        }
        if self.replication.batch_limit == 0 {
            return Err(Error::Config("replication batch limit must be positive".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::local("/tmp/fragmesh");
        assert!(config.validate().is_ok());
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[1].database.sqlite_path.as_deref(), Some("/tmp/fragmesh/node2.db"));
        assert_eq!(config.transactions.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.replication.batch_limit, 100);

        let topology = config.topology().unwrap();
        assert_eq!(topology.owner_of("Credit"), Some(NodeId::new(2)));
    }

    #[test]
    fn test_idle_timeout_disabled() {
        let config = TransactionConfig { idle_timeout_ms: 0, ..Default::default() };
        assert_eq!(config.idle_timeout(), None);
        let config = TransactionConfig { idle_timeout_ms: -1, ..Default::default() };
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_from_json() {
        let config = ClusterConfig::from_json(r#"{
            "nodes": [
                {"id": 1, "role": "hub", "database": {"sqlite_path": "a.db"}},
                {"id": 2, "role": "fragment", "owned_types": ["Credit"], "database": {"sqlite_path": "b.db"}}
            ],
            "transactions": {"idle_timeout_ms": 250},
            "replication": {"enabled": false, "interval_ms": 50}
        }"#).unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.transactions.idle_timeout_ms, 250);
        assert_eq!(config.transactions.sweep_interval, Duration::from_millis(500));
        assert!(!config.replication.enabled);
        assert_eq!(config.replication.interval, Duration::from_millis(50));

        let err = ClusterConfig::from_json(r#"{"nodes": []}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TX_IDLE_TIMEOUT_MS", "1200"),
            ("AUTO_REPLICATION_ENABLED", "false"),
            ("AUTO_REPLICATION_LIMIT", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = ClusterConfig::local("data");
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.transactions.idle_timeout_ms, 1200);
        assert!(!config.replication.enabled);
        assert_eq!(config.replication.batch_limit, 5);

        let mut config = ClusterConfig::local("data");
        let err = config.apply_overrides(|k| (k == "AUTO_REPLICATION_LIMIT").then(|| "lots".to_string()));
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
