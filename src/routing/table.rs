//! Immutable routing table
//!
//! `RoutingTable` maps index name to an `Arc<IndexRoutingTable>`, so a new
//! table shares every index it did not touch with its predecessor.

use crate::common::{Error, Result};
use crate::routing::shard::{ShardId, ShardRouting, ShardState, UnassignedInfo, UnassignedReason};
use crate::routing::state::IndexMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// All copies of one shard id. Relocation targets are not stored; they are
/// derived from their `RELOCATING` source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    shard_id: ShardId,
    copies: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    pub(crate) fn new(shard_id: ShardId, copies: Vec<ShardRouting>) -> Self {
        Self { shard_id, copies }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn copies(&self) -> &[ShardRouting] {
        &self.copies
    }

    pub fn primary(&self) -> Option<&ShardRouting> {
        self.copies.iter().find(|c| c.primary())
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ShardRouting> {
        self.copies.iter().filter(|c| !c.primary())
    }

    pub fn active_count(&self) -> usize {
        self.copies.iter().filter(|c| c.active()).count()
    }

    pub fn unassigned(&self) -> impl Iterator<Item = &ShardRouting> {
        self.copies.iter().filter(|c| c.unassigned())
    }

    /// The copy held by `node_id`, including a derived relocation target.
    pub fn copy_on(&self, node_id: &str) -> Option<ShardRouting> {
        self.copies.iter().find_map(|c| {
            if c.current_node_id() == Some(node_id) {
                Some(c.clone())
            } else if c.relocating_node_id() == Some(node_id) {
                c.relocation_target()
            } else {
                None
            }
        })
    }

    fn with_number_of_replicas(&self, replicas: u32, at: DateTime<Utc>) -> Self {
        let wanted = replicas as usize;
        let current = self.replicas().count();
        let mut copies = self.copies.clone();

        if wanted > current {
            for _ in current..wanted {
                copies.push(ShardRouting::new_unassigned(
                    self.shard_id.clone(),
                    false,
                    UnassignedInfo::new(UnassignedReason::ReplicaAdded, at),
                ));
            }
        } else {
            let mut excess = current - wanted;
            // unassigned first, then in-flight, then started
            for state in [
                ShardState::Unassigned,
                ShardState::Initializing,
                ShardState::Relocating,
                ShardState::Started,
            ] {
                while excess > 0 {
                    match copies
                        .iter()
                        .rposition(|c| !c.primary() && c.state() == state)
                    {
                        Some(pos) => {
                            copies.remove(pos);
                            excess -= 1;
                        }
                        None => break,
                    }
                }
            }
        }

        Self::new(self.shard_id.clone(), copies)
    }
}

/// Routing for every shard of one index, ordered by shard number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    index: String,
    shards: Vec<IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    /// All copies unassigned: one primary plus `number_of_replicas` replicas per shard.
    pub fn new_unassigned(meta: &IndexMetadata, at: DateTime<Utc>) -> Self {
        let shards = (0..meta.number_of_shards)
            .map(|id| {
                let shard_id = ShardId::new(meta.name.clone(), id);
                let info = UnassignedInfo::new(UnassignedReason::IndexCreated, at);
                let mut copies = vec![ShardRouting::new_unassigned(
                    shard_id.clone(),
                    true,
                    info.clone(),
                )];
                for _ in 0..meta.number_of_replicas {
                    copies.push(ShardRouting::new_unassigned(
                        shard_id.clone(),
                        false,
                        info.clone(),
                    ));
                }
                IndexShardRoutingTable::new(shard_id, copies)
            })
            .collect();

        Self {
            index: meta.name.clone(),
            shards,
        }
    }

    pub(crate) fn new(index: String, shards: Vec<IndexShardRoutingTable>) -> Self {
        Self { index, shards }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn shards(&self) -> &[IndexShardRoutingTable] {
        &self.shards
    }

    pub fn shard(&self, id: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(id as usize)
    }

    pub fn copies(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().flat_map(|s| s.copies.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    indices: BTreeMap<String, Arc<IndexRoutingTable>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name).map(|t| t.as_ref())
    }

    pub(crate) fn index_arc(&self, name: &str) -> Option<&Arc<IndexRoutingTable>> {
        self.indices.get(name)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values().map(|t| t.as_ref())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn shard(&self, shard_id: &ShardId) -> Option<&IndexShardRoutingTable> {
        self.index(&shard_id.index)
            .and_then(|t| t.shard(shard_id.id))
    }

    /// Every stored copy (relocation targets excluded).
    pub fn copies(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices.values().flat_map(|t| t.copies())
    }

    pub fn copies_with_state(&self, state: ShardState) -> Vec<&ShardRouting> {
        self.copies().filter(|c| c.state() == state).collect()
    }

    /// Every node id a copy lives on or is relocating to.
    pub fn referenced_nodes(&self) -> BTreeSet<String> {
        let mut nodes = BTreeSet::new();
        for copy in self.copies() {
            if let Some(node) = copy.current_node_id() {
                nodes.insert(node.to_string());
            }
            if let Some(node) = copy.relocating_node_id() {
                nodes.insert(node.to_string());
            }
        }
        nodes
    }

    pub fn add_index(&self, meta: &IndexMetadata, at: DateTime<Utc>) -> Result<Self> {
        if self.indices.contains_key(&meta.name) {
            return Err(Error::IndexAlreadyExists(meta.name.clone()));
        }
        let mut indices = self.indices.clone();
        indices.insert(
            meta.name.clone(),
            Arc::new(IndexRoutingTable::new_unassigned(meta, at)),
        );
        Ok(Self { indices })
    }

    pub fn remove_index(&self, name: &str) -> Result<Self> {
        let mut indices = self.indices.clone();
        indices
            .remove(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        Ok(Self { indices })
    }

    pub fn update_number_of_replicas(
        &self,
        name: &str,
        replicas: u32,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        let table = self
            .indices
            .get(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        let shards = table
            .shards
            .iter()
            .map(|s| s.with_number_of_replicas(replicas, at))
            .collect();

        let mut indices = self.indices.clone();
        indices.insert(
            name.to_string(),
            Arc::new(IndexRoutingTable::new(name.to_string(), shards)),
        );
        Ok(Self { indices })
    }

    pub(crate) fn from_indices(indices: BTreeMap<String, Arc<IndexRoutingTable>>) -> Self {
        Self { indices }
    }
}
