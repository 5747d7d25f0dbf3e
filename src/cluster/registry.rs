use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::NodeId;
use crate::database::{Row, Store, Value};
use crate::error::{Error, Result};

/// Node liveness registry used to simulate crash and recovery.
///
/// Every node store keeps its own copy of `node_status`, so the registry has
/// no single point of failure. Reads merge the copies by newest
/// `updated_at`; writes go to every copy and succeed if at least one lands.
/// When no copy can answer, a node is reported online.
#[derive(Debug)]
pub struct NodeRegistry {
    /// Nodes the registry knows about
    known: Vec<NodeId>,
    /// Status copies, one per node store
    copies: Vec<(NodeId, Arc<dyn Store>)>,
    /// Last stamp handed out, so successive writes always order
    clock: AtomicI64,
}

#[derive(Debug, Clone, Copy)]
struct StatusEntry {
    node: NodeId,
    online: bool,
    updated_at: i64,
}

impl NodeRegistry {
    /// Create a registry over the given status copies
    pub fn new(known: Vec<NodeId>, copies: Vec<(NodeId, Arc<dyn Store>)>) -> Self {
        Self {
            known,
            copies,
            clock: AtomicI64::new(0),
        }
    }

    /// Seeds a default "online" row for every known node in every reachable
    /// copy. Existing rows are left alone.
    pub async fn init(&self) {
        for (copy, store) in &self.copies {
            for node in &self.known {
                let result = store.execute(
                    "INSERT INTO node_status (node_id, online, updated_at) VALUES ($1, 1, 0) \
                     ON CONFLICT (node_id) DO NOTHING",
                    &[Value::from(*node)],
                ).await;
                if let Err(e) = result {
                    warn!(copy = %copy, node = %node, error = %e, "failed to seed node status");
                }
            }
        }
    }

    /// Whether `node` is online, failing open when no copy is reachable.
    pub async fn is_online(&self, node: NodeId) -> bool {
        let entries = self.read_copies(Some(node)).await;
        newest(&entries, node).map(|e| e.online).unwrap_or(true)
    }

    /// Marks `node` online or offline in every reachable copy.
    pub async fn set_online(&self, node: NodeId, online: bool) -> Result<()> {
        if !self.known.contains(&node) {
            return Err(Error::validation(format!("unknown node id {}", node)));
        }

        let stamp = self.next_stamp();
        let writes = self.copies.iter().map(|(copy, store)| async move {
            let result = store.execute(
                "INSERT INTO node_status (node_id, online, updated_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (node_id) DO UPDATE SET online = excluded.online, updated_at = excluded.updated_at \
                 WHERE node_status.updated_at <= excluded.updated_at",
                &[Value::from(node), Value::Int(online as i64), Value::Int(stamp)],
            ).await;
            (*copy, result)
        });

        let mut landed = 0;
        let mut last_error = None;
        for (copy, result) in join_all(writes).await {
            match result {
                Ok(_) => landed += 1,
                Err(e) => {
                    warn!(copy = %copy, node = %node, error = %e, "node status write failed");
                    last_error = Some(e);
                }
            }
        }

        if landed == 0 {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no status copies configured".into());
            return Err(Error::internal(format!(
                "could not record status of node {} in any copy: {}",
                node, reason
            )));
        }

        info!(node = %node, online, copies = landed, "node status changed");
        Ok(())
    }

    /// Merged status of every known node; unknown rows default to online.
    pub async fn all_statuses(&self) -> BTreeMap<NodeId, bool> {
        let entries = self.read_copies(None).await;
        self.known
            .iter()
            .map(|&node| (node, newest(&entries, node).map(|e| e.online).unwrap_or(true)))
            .collect()
    }

    async fn read_copies(&self, node: Option<NodeId>) -> Vec<StatusEntry> {
        let reads = self.copies.iter().map(|(copy, store)| async move {
            let rows = match node {
                Some(node) => {
                    store.query(
                        "SELECT node_id, online, updated_at FROM node_status WHERE node_id = $1",
                        &[Value::from(node)],
                    ).await
                }
                None => store.query("SELECT node_id, online, updated_at FROM node_status", &[]).await,
            };
            (*copy, rows)
        });

        let mut entries = Vec::new();
        for (copy, rows) in join_all(reads).await {
            let rows = match rows {
                Ok(rows) => rows,
                Err(e) => {
                    debug!(copy = %copy, error = %e, "node status copy unreachable");
                    continue;
                }
            };
            for row in rows {
                match parse_entry(&row) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => debug!(copy = %copy, error = %e, "malformed node status row"),
                }
            }
        }
        entries
    }

    fn next_stamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.clock.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

fn parse_entry(row: &Row) -> crate::database::Result<StatusEntry> {
    Ok(StatusEntry {
        node: row.get("node_id")?,
        online: row.get("online")?,
        updated_at: row.get("updated_at")?,
    })
}

fn newest(entries: &[StatusEntry], node: NodeId) -> Option<StatusEntry> {
    entries
        .iter()
        .filter(|e| e.node == node)
        .max_by_key(|e| e.updated_at)
        .copied()
}
