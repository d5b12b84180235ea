//! Topology: which node owns which partition.
//!
//! The engine only asks two questions of the topology, through [`Cluster`].
//! [`StaticCluster`] answers them from a fixed node list and an explicit
//! partition table; cluster tending lives outside this crate and would
//! update that table through [`StaticCluster::assign`].

use std::sync::Arc;

use parking_lot::RwLock;
use shoal_proto::key::PARTITIONS;
use shoal_proto::Key;
use tracing::debug;

use crate::config::ClientConfig;
use crate::node::Node;

/// Routing interface consumed by the execution engine.
pub trait Cluster: Send + Sync {
    /// Node that currently owns `partition` of `namespace`, if it is active.
    fn node_for_partition(&self, namespace: &str, partition: u32, for_write: bool) -> Option<Arc<Node>>;

    /// Node that currently owns `key`, if it is active.
    fn node_for_key(&self, key: &Key, for_write: bool) -> Option<Arc<Node>> {
        self.node_for_partition(&key.namespace, key.partition_id(), for_write)
    }

    /// Every active node.
    fn active_nodes(&self) -> Vec<Arc<Node>>;
}

/// Fixed node list with a mutable partition table.
///
/// Reads and writes both go to the partition owner. The table is shared by
/// all namespaces.
#[derive(Debug)]
pub struct StaticCluster {
    nodes: Vec<Arc<Node>>,
    owners: RwLock<Vec<usize>>,
}

impl StaticCluster {
    /// Spread partitions round-robin over `nodes`.
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        let count = nodes.len().max(1);
        let owners = (0..PARTITIONS as usize).map(|p| p % count).collect();
        Self {
            nodes,
            owners: RwLock::new(owners),
        }
    }

    /// Build the node list from `config.nodes`.
    pub fn from_config(config: &ClientConfig) -> Self {
        let breaker = config.error_rate();
        let nodes = config
            .nodes
            .iter()
            .map(|n| Arc::new(Node::new(n.name.clone(), n.address.clone(), breaker)))
            .collect();
        Self::new(nodes)
    }

    /// All nodes, active or not.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Node by name.
    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.name() == name).cloned()
    }

    /// Move `partition` to the node called `name`.
    ///
    /// Returns `false` if there is no such node or partition.
    pub fn assign(&self, partition: u32, name: &str) -> bool {
        let Some(index) = self.nodes.iter().position(|n| n.name() == name) else {
            return false;
        };
        let mut owners = self.owners.write();
        match owners.get_mut(partition as usize) {
            Some(owner) => {
                debug!(partition, node = %name, "partition reassigned");
                *owner = index;
                true
            }
            None => false,
        }
    }

    /// Move every partition to the node called `name`.
    pub fn assign_all(&self, name: &str) -> bool {
        let Some(index) = self.nodes.iter().position(|n| n.name() == name) else {
            return false;
        };
        self.owners.write().iter_mut().for_each(|o| *o = index);
        true
    }

    /// Name of the node owning `partition`, active or not.
    pub fn owner(&self, partition: u32) -> Option<&str> {
        let index = *self.owners.read().get(partition as usize)?;
        self.nodes.get(index).map(|n| n.name())
    }
}

impl Cluster for StaticCluster {
    fn node_for_partition(&self, _namespace: &str, partition: u32, _for_write: bool) -> Option<Arc<Node>> {
        let index = *self.owners.read().get(partition as usize)?;
        self.nodes.get(index).filter(|n| n.is_active()).cloned()
    }

    fn active_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().filter(|n| n.is_active()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::ErrorRateConfig;

    fn cluster(names: &[&str]) -> StaticCluster {
        StaticCluster::new(
            names
                .iter()
                .map(|n| Arc::new(Node::new(*n, format!("{n}:3000"), ErrorRateConfig::default())))
                .collect(),
        )
    }

    #[test]
    fn test_round_robin_ownership() {
        let c = cluster(&["A", "B"]);
        assert_eq!(c.owner(0), Some("A"));
        assert_eq!(c.owner(1), Some("B"));
        assert_eq!(c.owner(4095), Some("B"));
        assert_eq!(c.owner(4096), None);
    }

    #[test]
    fn test_inactive_owner_not_returned() {
        let c = cluster(&["A", "B"]);
        c.node("A").unwrap().set_active(false);
        assert!(c.node_for_partition("test", 0, false).is_none());
        assert_eq!(c.node_for_partition("test", 1, false).unwrap().name(), "B");
        assert_eq!(c.active_nodes().len(), 1);
    }

    #[test]
    fn test_assign_moves_key() {
        let c = cluster(&["A", "B"]);
        let key = Key::new("test", "demo", 7i64).unwrap();
        let pid = key.partition_id();
        assert!(c.assign(pid, "B"));
        assert_eq!(c.node_for_key(&key, true).unwrap().name(), "B");
        assert!(c.assign(pid, "A"));
        assert_eq!(c.node_for_key(&key, true).unwrap().name(), "A");
        assert!(!c.assign(pid, "Z"));
    }

    #[test]
    fn test_assign_all() {
        let c = cluster(&["A", "B", "C"]);
        assert!(c.assign_all("C"));
        assert!((0..PARTITIONS).all(|p| c.owner(p) == Some("C")));
    }

    #[test]
    fn test_empty_cluster_has_no_owner() {
        let c = cluster(&[]);
        assert!(c.node_for_partition("test", 0, false).is_none());
    }
}
