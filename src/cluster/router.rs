use std::collections::BTreeSet;
use std::sync::Arc;

use super::{NodeId, NodeRole, Topology};

/// Decides which nodes receive a copy of a write.
///
/// Writes on the hub go down to the fragment owning the row's type (or
/// nowhere when no fragment owns it). Writes on a fragment always go up to
/// the hub.
#[derive(Debug, Clone)]
pub struct Router {
    topology: Arc<Topology>,
}

impl Router {
    /// Create a new router over a fixed topology
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    /// The topology this router routes over
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Destination nodes for a write of `record_type` that originated on `origin`.
    pub fn determine_targets(&self, origin: NodeId, record_type: &str) -> BTreeSet<NodeId> {
        let mut targets = BTreeSet::new();
        match self.topology.node(origin).map(|n| n.role) {
            Some(NodeRole::Hub) => {
                if let Some(owner) = self.topology.owner_of(record_type) {
                    targets.insert(owner);
                }
            }
            Some(NodeRole::Fragment) => {
                targets.insert(self.topology.hub());
            }
            None => {}
        }
        targets
    }

    /// Second hop for a write that travelled fragment → hub: the hub's own
    /// targets for the row, minus the fragment the write came from unless
    /// `relay_to_origin` is set.
    pub fn fanout_targets(&self, origin: NodeId, record_type: &str, relay_to_origin: bool) -> BTreeSet<NodeId> {
        let mut targets = self.determine_targets(self.topology.hub(), record_type);
        if !relay_to_origin {
            targets.remove(&origin);
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn router() -> Router {
        Router::new(Arc::new(Topology::default()))
    }

    fn set(ids: &[u32]) -> BTreeSet<NodeId> {
        ids.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_hub_routes_to_owner() {
        let router = router();
        assert_eq!(router.determine_targets(NodeId::new(1), "Credit"), set(&[2]));
        assert_eq!(router.determine_targets(NodeId::new(1), "Debit (Withdrawal)"), set(&[3]));
        assert_eq!(router.determine_targets(NodeId::new(1), "VYBER"), set(&[3]));
        assert!(router.determine_targets(NodeId::new(1), "Interest").is_empty());
    }

    #[test]
    fn test_fragments_route_to_hub() {
        let router = router();
        assert_eq!(router.determine_targets(NodeId::new(2), "Credit"), set(&[1]));
        assert_eq!(router.determine_targets(NodeId::new(3), "Credit"), set(&[1]));
        assert!(router.determine_targets(NodeId::new(9), "Credit").is_empty());
    }

    #[test]
    fn test_fanout_skips_origin() {
        let router = router();
        assert!(router.fanout_targets(NodeId::new(2), "Credit", false).is_empty());
        assert_eq!(router.fanout_targets(NodeId::new(2), "VYBER", false), set(&[3]));
        assert_eq!(router.fanout_targets(NodeId::new(2), "Credit", true), set(&[2]));
    }

    proptest! {
        #[test]
        fn prop_at_most_one_target(origin in 0u32..6, record_type in "[A-Za-z ()]{0,24}") {
            let targets = router().determine_targets(NodeId::new(origin), &record_type);
            prop_assert!(targets.len() <= 1);
            prop_assert!(!targets.contains(&NodeId::new(origin)));
        }

        #[test]
        fn prop_fragment_writes_reach_hub(origin in 2u32..4, record_type in ".*") {
            prop_assert_eq!(router().determine_targets(NodeId::new(origin), &record_type), set(&[1]));
        }
    }
}
