//! Static cluster topology: which nodes exist, which one is the hub, and
//! which record types each fragment owns.

use std::collections::HashSet;
use std::fmt;
use serde::{Deserialize, Serialize};

use crate::database::Value;
use crate::error::{Error, Result};

mod registry;
mod router;

pub use registry::NodeRegistry;
pub use router::Router;

/// Node identifier (1, 2, 3 in the default topology)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a new NodeId
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Numeric value of the id
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::Int(id.0 as i64)
    }
}

/// Role of a node in the star topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Central node holding every row
    Hub,
    /// Node holding only the rows whose type it owns
    Fragment,
}

/// One node of the topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node id
    pub id: NodeId,
    /// Hub or fragment
    pub role: NodeRole,
    /// Record types owned by this fragment (empty for the hub)
    #[serde(default)]
    pub owned_types: Vec<String>,
}

impl NodeSpec {
    /// Whether this node owns rows of `record_type`
    pub fn owns(&self, record_type: &str) -> bool {
        self.role == NodeRole::Fragment && self.owned_types.iter().any(|t| t == record_type.trim())
    }
}

/// The fixed set of nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    nodes: Vec<NodeSpec>,
}

impl Topology {
    /// Builds a topology, checking that it is a valid star.
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self> {
        let topology = Self { nodes };
        topology.validate()?;
        Ok(topology)
    }

    /// Node 1 is the hub, node 2 owns "Credit", node 3 owns
    /// "Debit (Withdrawal)" and "VYBER".
    pub fn default_three_node() -> Self {
        Self {
            nodes: vec![
                NodeSpec { id: NodeId(1), role: NodeRole::Hub, owned_types: Vec::new() },
                NodeSpec { id: NodeId(2), role: NodeRole::Fragment, owned_types: vec!["Credit".into()] },
                NodeSpec {
                    id: NodeId(3),
                    role: NodeRole::Fragment,
                    owned_types: vec!["Debit (Withdrawal)".into(), "VYBER".into()],
                },
            ],
        }
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut owned = HashSet::new();
        let mut hubs = 0;
        for node in &self.nodes {
            if !ids.insert(node.id) {
                return Err(Error::Config(format!("duplicate node id {}", node.id)));
            }
            match node.role {
                NodeRole::Hub => {
                    hubs += 1;
                    if !node.owned_types.is_empty() {
                        return Err(Error::Config(format!("hub node {} cannot own types", node.id)));
                    }
                }
                NodeRole::Fragment => {
                    for t in &node.owned_types {
                        if !owned.insert(t.trim().to_string()) {
                            return Err(Error::Config(format!("type {:?} owned by more than one fragment", t)));
                        }
                    }
                }
            }
        }
        if hubs != 1 {
            return Err(Error::Config(format!("expected exactly one hub, found {}", hubs)));
        }
        Ok(())
    }

    /// All nodes, in configuration order
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the topology has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids, in configuration order
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|n| n.id)
    }

    /// Looks up a node
    pub fn node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Whether `id` is part of the topology
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// The hub's id
    pub fn hub(&self) -> NodeId {
        self.nodes
            .iter()
            .find(|n| n.role == NodeRole::Hub)
            .map(|n| n.id)
            .unwrap_or(NodeId(0))
    }

    /// Whether `id` is the hub
    pub fn is_hub(&self, id: NodeId) -> bool {
        self.node(id).map(|n| n.role == NodeRole::Hub).unwrap_or(false)
    }

    /// Fragment owning `record_type`, if any
    pub fn owner_of(&self, record_type: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.owns(record_type)).map(|n| n.id)
    }

    /// Every (source, target) pair replication flows along: hub to each
    /// fragment and each fragment back to the hub.
    pub fn replication_pairs(&self) -> Vec<(NodeId, NodeId)> {
        let hub = self.hub();
        let fragments: Vec<NodeId> = self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Fragment)
            .map(|n| n.id)
            .collect();

        let mut pairs: Vec<(NodeId, NodeId)> = fragments.iter().map(|&f| (hub, f)).collect();
        pairs.extend(fragments.iter().map(|&f| (f, hub)));
        pairs
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::default_three_node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topology() {
        let topology = Topology::default();
        assert!(topology.validate().is_ok());
        assert_eq!(topology.hub(), NodeId::new(1));
        assert_eq!(topology.owner_of("Credit"), Some(NodeId::new(2)));
        assert_eq!(topology.owner_of(" VYBER "), Some(NodeId::new(3)));
        assert_eq!(topology.owner_of("Interest"), None);
        assert_eq!(
            topology.replication_pairs(),
            vec![
                (NodeId::new(1), NodeId::new(2)),
                (NodeId::new(1), NodeId::new(3)),
                (NodeId::new(2), NodeId::new(1)),
                (NodeId::new(3), NodeId::new(1)),
            ]
        );
    }

    #[test]
    fn test_invalid_topologies() {
        let two_hubs = vec![
            NodeSpec { id: NodeId(1), role: NodeRole::Hub, owned_types: vec![] },
            NodeSpec { id: NodeId(2), role: NodeRole::Hub, owned_types: vec![] },
        ];
        assert!(Topology::new(two_hubs).is_err());

        let shared_type = vec![
            NodeSpec { id: NodeId(1), role: NodeRole::Hub, owned_types: vec![] },
            NodeSpec { id: NodeId(2), role: NodeRole::Fragment, owned_types: vec!["Credit".into()] },
            NodeSpec { id: NodeId(3), role: NodeRole::Fragment, owned_types: vec!["Credit".into()] },
        ];
        assert!(Topology::new(shared_type).is_err());
    }

    #[test]
    fn test_node_id_serde() {
        let id: NodeId = serde_json::from_str("3").unwrap();
        assert_eq!(id, NodeId::new(3));
        assert_eq!(serde_json::to_string(&id).unwrap(), "3");
        assert_eq!(id.to_string(), "3");
    }
}
