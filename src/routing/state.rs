//! Cluster membership, index metadata and the immutable cluster snapshot

use crate::allocation::explain::AllocationHistory;
use crate::common::{Error, Result};
use crate::routing::table::RoutingTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Disk usage reported by a data node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 * 100.0 / self.total_bytes as f64
    }
}

/// A live data node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskUsage>,
}

impl DiscoveryNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            disk: None,
        }
    }

    pub fn with_disk(mut self, total_bytes: u64, free_bytes: u64) -> Self {
        self.disk = Some(DiskUsage {
            total_bytes,
            free_bytes,
        });
        self
    }
}

/// Current node membership, ordered by node id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<String, DiscoveryNode>,
}

impl DiscoveryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter().map(DiscoveryNode::new).collect()
    }

    pub fn add(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn remove(mut self, node_id: &str) -> Self {
        self.nodes.remove(node_id);
        self
    }

    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<DiscoveryNode> for DiscoveryNodes {
    fn from_iter<T: IntoIterator<Item = DiscoveryNode>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }
}

/// Declared topology of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            name: name.into(),
            number_of_shards,
            number_of_replicas,
        }
    }

    /// Copies per shard id: the primary plus every replica
    pub fn copies_per_shard(&self) -> usize {
        1 + self.number_of_replicas as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    indices: BTreeMap<String, IndexMetadata>,
}

impl Metadata {
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values()
    }
}

/// Immutable snapshot of the cluster.
///
/// Cloning is cheap; every component sits behind an `Arc` and a derived
/// state shares whatever it did not change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterState {
    version: u64,
    nodes: Arc<DiscoveryNodes>,
    metadata: Arc<Metadata>,
    routing_table: Arc<RoutingTable>,
    history: Arc<AllocationHistory>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn nodes(&self) -> &DiscoveryNodes {
        &self.nodes
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn history(&self) -> &AllocationHistory {
        &self.history
    }

    /// Replace node membership. Copies on departed nodes are reconciled by the next reroute.
    pub fn with_nodes(&self, nodes: DiscoveryNodes) -> Self {
        Self {
            version: self.version + 1,
            nodes: Arc::new(nodes),
            ..self.clone()
        }
    }

    /// Add an index whose copies all start unassigned.
    pub fn with_index(&self, meta: IndexMetadata, at: DateTime<Utc>) -> Result<Self> {
        if meta.number_of_shards == 0 {
            return Err(Error::InvalidConfig(format!(
                "index [{}] needs at least one shard",
                meta.name
            )));
        }
        let routing_table = self.routing_table.add_index(&meta, at)?;
        let mut metadata = (*self.metadata).clone();
        metadata.indices.insert(meta.name.clone(), meta);

        Ok(Self {
            version: self.version + 1,
            metadata: Arc::new(metadata),
            routing_table: Arc::new(routing_table),
            ..self.clone()
        })
    }

    pub fn with_number_of_replicas(
        &self,
        index: &str,
        replicas: u32,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        let routing_table = self
            .routing_table
            .update_number_of_replicas(index, replicas, at)?;
        let mut metadata = (*self.metadata).clone();
        let meta = metadata
            .indices
            .get_mut(index)
            .ok_or_else(|| Error::IndexNotFound(index.to_string()))?;
        meta.number_of_replicas = replicas;

        Ok(Self {
            version: self.version + 1,
            metadata: Arc::new(metadata),
            routing_table: Arc::new(routing_table),
            ..self.clone()
        })
    }

    pub fn remove_index(&self, index: &str) -> Result<Self> {
        let routing_table = self.routing_table.remove_index(index)?;
        let mut metadata = (*self.metadata).clone();
        metadata.indices.remove(index);

        Ok(Self {
            version: self.version + 1,
            metadata: Arc::new(metadata),
            routing_table: Arc::new(routing_table),
            history: Arc::new(self.history.without_index(index)),
            ..self.clone()
        })
    }

    /// The successor produced by a reroute pass.
    pub(crate) fn next(&self, routing_table: RoutingTable, history: AllocationHistory) -> Self {
        Self {
            version: self.version + 1,
            nodes: self.nodes.clone(),
            metadata: self.metadata.clone(),
            routing_table: Arc::new(routing_table),
            history: Arc::new(history),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ShardState;

    #[test]
    fn test_versions_increase() {
        let state = ClusterState::new();
        assert_eq!(state.version(), 0);

        let state = state.with_nodes(DiscoveryNodes::from_ids(["node1", "node2"]));
        assert_eq!(state.version(), 1);
        assert_eq!(state.nodes().len(), 2);

        let state = state
            .with_index(IndexMetadata::new("test", 2, 1), Utc::now())
            .unwrap();
        assert_eq!(state.version(), 2);
        assert_eq!(
            state
                .routing_table()
                .copies_with_state(ShardState::Unassigned)
                .len(),
            4
        );
    }

    #[test]
    fn test_replica_update_changes_metadata() {
        let at = Utc::now();
        let state = ClusterState::new()
            .with_index(IndexMetadata::new("test", 1, 1), at)
            .unwrap()
            .with_number_of_replicas("test", 2, at)
            .unwrap();
        assert_eq!(state.metadata().index("test").unwrap().number_of_replicas, 2);
        assert!(state.with_number_of_replicas("nope", 1, at).is_err());

        let state = state.remove_index("test").unwrap();
        assert!(state.metadata().index("test").is_none());
        assert!(!state.routing_table().has_index("test"));
    }

    #[test]
    fn test_zero_shard_index_rejected() {
        let result = ClusterState::new().with_index(IndexMetadata::new("empty", 0, 1), Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_disk_usage() {
        let usage = DiskUsage {
            total_bytes: 200,
            free_bytes: 50,
        };
        assert_eq!(usage.used_bytes(), 150);
        assert!((usage.used_percent() - 75.0).abs() < f64::EPSILON);
    }
}
