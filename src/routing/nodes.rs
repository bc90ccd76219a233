//! Mutable per-pass working view of the routing table
//!
//! `RoutingNodes` is built from a `ClusterState` at the start of a reroute,
//! mutated freely during the pass and frozen back into a `RoutingTable`.
//! Copies are indexed by node (`RoutingNode::shards`) and by shard id
//! (`assignments`); every mutation keeps both indexes in sync.

use crate::common::{Error, Result};
use crate::routing::changes::ShardTransition;
use crate::routing::shard::{ShardId, ShardRouting, ShardState, UnassignedInfo};
use crate::routing::state::{ClusterState, Metadata};
use crate::routing::table::{IndexRoutingTable, IndexShardRoutingTable, RoutingTable};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A node and the copies currently assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingNode {
    node_id: String,
    shards: BTreeMap<ShardId, ShardRouting>,
}

impl RoutingNode {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            shards: BTreeMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn shard(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.shards.get(shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn count_in_state(&self, state: ShardState) -> usize {
        self.shards.values().filter(|s| s.state() == state).count()
    }

    /// Copies that stay here once in-flight relocations complete.
    pub fn weight(&self) -> usize {
        self.shards.values().filter(|s| !s.relocating()).count()
    }
}

#[derive(Debug, Clone)]
pub struct RoutingNodes {
    nodes: BTreeMap<String, RoutingNode>,
    live: BTreeSet<String>,
    departed: BTreeSet<String>,
    unassigned: Vec<ShardRouting>,
    assignments: BTreeMap<ShardId, BTreeSet<String>>,
    transitions: Vec<ShardTransition>,
}

impl RoutingNodes {
    pub fn new(state: &ClusterState) -> Result<Self> {
        let live: BTreeSet<String> = state.nodes().ids().map(String::from).collect();
        let mut routing_nodes = Self {
            nodes: live
                .iter()
                .map(|id| (id.clone(), RoutingNode::new(id)))
                .collect(),
            live,
            departed: BTreeSet::new(),
            unassigned: Vec::new(),
            assignments: BTreeMap::new(),
            transitions: Vec::new(),
        };

        for copy in state.routing_table().copies() {
            if copy.unassigned() {
                routing_nodes.unassigned.push(copy.clone());
                continue;
            }
            routing_nodes.add_copy(copy.clone())?;
            if let Some(target) = copy.relocation_target() {
                routing_nodes.add_copy(target)?;
            }
        }
        Ok(routing_nodes)
    }

    // === Queries ===

    pub fn node(&self, node_id: &str) -> Option<&RoutingNode> {
        self.nodes.get(node_id)
    }

    /// Live nodes in node id order.
    pub fn live_nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.values().filter(|n| self.live.contains(&n.node_id))
    }

    pub fn is_live(&self, node_id: &str) -> bool {
        self.live.contains(node_id)
    }

    /// Nodes that still own copies but are no longer members.
    pub fn departed_node_ids(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| !self.live.contains(*id))
            .cloned()
            .collect()
    }

    /// Whether `node_id` was removed earlier in this pass.
    pub fn has_departed(&self, node_id: &str) -> bool {
        self.departed.contains(node_id)
    }

    pub fn unassigned(&self) -> &[ShardRouting] {
        &self.unassigned
    }

    pub fn copy_on(&self, shard_id: &ShardId, node_id: &str) -> Option<&ShardRouting> {
        self.nodes.get(node_id).and_then(|n| n.shard(shard_id))
    }

    /// Assigned copies of a shard, relocation targets included, in node id order.
    pub fn copies(&self, shard_id: &ShardId) -> Vec<&ShardRouting> {
        self.assignments
            .get(shard_id)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| self.copy_on(shard_id, n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The assigned primary, never a relocation target.
    pub fn primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.copies(shard_id)
            .into_iter()
            .find(|c| c.primary() && !c.is_relocation_target())
    }

    pub fn active_primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.primary(shard_id).filter(|p| p.active())
    }

    /// Slots (assigned or unassigned) currently held for a shard.
    pub fn slot_count(&self, shard_id: &ShardId) -> usize {
        let assigned = self
            .copies(shard_id)
            .into_iter()
            .filter(|c| !c.is_relocation_target())
            .count();
        let unassigned = self
            .unassigned
            .iter()
            .filter(|c| c.shard_id() == shard_id)
            .count();
        assigned + unassigned
    }

    pub fn count_in_state(&self, state: ShardState) -> usize {
        self.nodes.values().map(|n| n.count_in_state(state)).sum()
    }

    /// Copies initializing on `node_id`, relocation targets included.
    pub fn incoming_recoveries(&self, node_id: &str) -> usize {
        self.node(node_id)
            .map(|n| n.count_in_state(ShardState::Initializing))
            .unwrap_or(0)
    }

    /// Recoveries reading from `node_id`: its relocations plus replicas
    /// initializing from a primary it holds.
    pub fn outgoing_recoveries(&self, node_id: &str) -> usize {
        let Some(node) = self.node(node_id) else {
            return 0;
        };
        let relocating = node.count_in_state(ShardState::Relocating);
        let replica_recoveries: usize = node
            .shards()
            .filter(|s| s.primary() && s.active())
            .map(|p| {
                self.copies(p.shard_id())
                    .into_iter()
                    .filter(|c| !c.primary() && c.initializing() && !c.is_relocation_target())
                    .count()
            })
            .sum();
        relocating + replica_recoveries
    }

    /// Fresh primaries (no recovery source) initializing on `node_id`.
    pub fn initializing_primaries(&self, node_id: &str) -> usize {
        self.node(node_id)
            .map(|n| {
                n.shards()
                    .filter(|s| s.primary() && s.initializing() && !s.is_relocation_target())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn transitions(&self) -> &[ShardTransition] {
        &self.transitions
    }

    pub fn take_transitions(&mut self) -> Vec<ShardTransition> {
        std::mem::take(&mut self.transitions)
    }

    // === Mutations ===

    /// Place an unassigned copy (matched by value) on `node_id`.
    pub fn initialize(&mut self, copy: &ShardRouting, node_id: &str) -> Result<()> {
        let pos = self
            .unassigned
            .iter()
            .position(|u| u == copy)
            .ok_or_else(|| {
                Error::InvariantViolation(format!("{} is not in the unassigned list", copy))
            })?;
        let initializing = self.unassigned[pos].initialize(node_id)?;
        self.add_copy(initializing)?;
        self.unassigned.remove(pos);

        let source = if copy.primary() {
            None
        } else {
            self.active_primary(copy.shard_id())
                .and_then(|p| p.current_node_id())
                .map(String::from)
        };
        self.transitions.push(ShardTransition::Initialized {
            shard_id: copy.shard_id().clone(),
            node: node_id.to_string(),
            primary: copy.primary(),
            source,
        });
        Ok(())
    }

    /// INITIALIZING -> STARTED. Completing a relocation removes its source.
    pub fn start(&mut self, shard_id: &ShardId, node_id: &str) -> Result<()> {
        let copy = self.expect_copy(shard_id, node_id)?.clone();
        let started = copy.move_to_started()?;

        if copy.is_relocation_target() {
            let source_node = copy.relocating_node_id().unwrap_or_default().to_string();
            let source = self.expect_copy(shard_id, &source_node)?;
            if !source.relocating() || source.relocating_node_id() != Some(node_id) {
                return Err(Error::InvariantViolation(format!(
                    "relocation target {} does not match source {}",
                    copy, source
                )));
            }
            self.remove_copy(shard_id, &source_node)?;
        }
        self.replace_copy(started)?;
        self.transitions.push(ShardTransition::Started {
            shard_id: shard_id.clone(),
            node: node_id.to_string(),
        });
        Ok(())
    }

    /// STARTED copy on `from` -> RELOCATING, plus its INITIALIZING target on `to`.
    pub fn relocate(&mut self, shard_id: &ShardId, from: &str, to: &str) -> Result<()> {
        let copy = self.expect_copy(shard_id, from)?;
        let relocating = copy.relocate(to)?;
        let target = relocating.relocation_target().ok_or_else(|| {
            Error::InvariantViolation(format!("{} has no relocation target", relocating))
        })?;
        let primary = relocating.primary();

        self.add_copy(target)?;
        self.replace_copy(relocating)?;
        self.transitions.push(ShardTransition::RelocationStarted {
            shard_id: shard_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            primary,
        });
        Ok(())
    }

    /// Undo an in-flight move: drop the target, the source goes back to STARTED.
    pub fn cancel_relocation(&mut self, shard_id: &ShardId, source_node: &str) -> Result<()> {
        let source = self.expect_copy(shard_id, source_node)?.clone();
        let reverted = source.cancel_relocation()?;
        let target_node = source.relocating_node_id().unwrap_or_default().to_string();

        self.remove_copy(shard_id, &target_node)?;
        self.replace_copy(reverted)?;
        self.transitions.push(ShardTransition::RelocationCancelled {
            shard_id: shard_id.clone(),
            source: source_node.to_string(),
            target: target_node,
        });
        Ok(())
    }

    /// Turn an assigned copy back into an unassigned slot. A relocating
    /// source takes its target with it.
    pub fn move_to_unassigned(
        &mut self,
        shard_id: &ShardId,
        node_id: &str,
        info: UnassignedInfo,
    ) -> Result<()> {
        let copy = self.expect_copy(shard_id, node_id)?.clone();
        let reason = info.reason;
        let unassigned = copy.move_to_unassigned(info)?;

        if let Some(target_node) = copy.relocating_node_id().filter(|_| copy.relocating()) {
            self.remove_copy(shard_id, target_node)?;
        }
        self.remove_copy(shard_id, node_id)?;
        self.unassigned.push(unassigned);
        self.transitions.push(ShardTransition::Unassigned {
            shard_id: shard_id.clone(),
            node: node_id.to_string(),
            reason,
        });
        Ok(())
    }

    /// Forget an assigned copy without keeping its slot.
    pub fn drop_copy(&mut self, shard_id: &ShardId, node_id: &str) -> Result<()> {
        let copy = self.expect_copy(shard_id, node_id)?.clone();
        if copy.is_relocation_target() {
            return Err(Error::InvariantViolation(format!(
                "relocation target {} must be cancelled, not dropped",
                copy
            )));
        }
        if let Some(target_node) = copy.relocating_node_id().filter(|_| copy.relocating()) {
            self.remove_copy(shard_id, target_node)?;
        }
        self.remove_copy(shard_id, node_id)?;
        self.transitions.push(ShardTransition::Dropped {
            shard_id: shard_id.clone(),
            node: node_id.to_string(),
        });
        Ok(())
    }

    /// Promote the best active replica on a live node once the shard has lost
    /// its assigned primary. Started copies win over relocating ones, then
    /// node id order.
    /// Any unassigned primary slot of the shard becomes a replica slot.
    pub fn promote_active_replica(&mut self, shard_id: &ShardId) -> Result<Option<String>> {
        if let Some(primary) = self.primary(shard_id) {
            return Err(Error::InvariantViolation(format!(
                "cannot promote a replica of {} while {} is primary",
                shard_id, primary
            )));
        }

        let candidate = self
            .copies(shard_id)
            .into_iter()
            .filter(|c| !c.primary() && c.active() && !c.is_relocation_target())
            .filter(|c| c.current_node_id().is_some_and(|n| self.is_live(n)))
            .min_by_key(|c| (!c.started(), c.current_node_id().map(String::from)))
            .cloned();
        let Some(replica) = candidate else {
            return Ok(None);
        };

        let node_id = replica.current_node_id().unwrap_or_default().to_string();
        self.replace_copy(replica.move_to_primary()?)?;
        if let Some(target_node) = replica.relocating_node_id() {
            let target = self.expect_copy(shard_id, target_node)?.move_to_primary()?;
            self.replace_copy(target)?;
        }
        for slot in self
            .unassigned
            .iter_mut()
            .filter(|u| u.shard_id() == shard_id && u.primary())
        {
            *slot = slot.move_to_replica();
        }

        self.transitions.push(ShardTransition::Promoted {
            shard_id: shard_id.clone(),
            node: node_id.clone(),
        });
        Ok(Some(node_id))
    }

    /// Add an unassigned slot, e.g. to restore a missing replica.
    pub fn add_unassigned(&mut self, copy: ShardRouting) -> Result<()> {
        if !copy.unassigned() {
            return Err(Error::InvariantViolation(format!(
                "{} is not unassigned",
                copy
            )));
        }
        self.unassigned.push(copy);
        Ok(())
    }

    /// Forget an emptied departed node.
    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        match self.nodes.get(node_id) {
            Some(node) if !node.is_empty() => Err(Error::InvariantViolation(format!(
                "node [{}] still holds {} copies",
                node_id,
                node.len()
            ))),
            _ => {
                self.nodes.remove(node_id);
                self.departed.insert(node_id.to_string());
                Ok(())
            }
        }
    }

    // === Freeze & validation ===

    /// Convert back into an immutable table, reusing every index of
    /// `previous` that came out unchanged.
    pub fn freeze(&self, previous: &RoutingTable, metadata: &Metadata) -> RoutingTable {
        let mut per_shard: BTreeMap<ShardId, Vec<ShardRouting>> = BTreeMap::new();
        for (shard_id, nodes) in &self.assignments {
            let mut copies: Vec<ShardRouting> = nodes
                .iter()
                .filter_map(|n| self.copy_on(shard_id, n))
                .filter(|c| !c.is_relocation_target())
                .cloned()
                .collect();
            copies.sort_by_key(|c| !c.primary());
            per_shard.insert(shard_id.clone(), copies);
        }

        let mut unassigned: BTreeMap<ShardId, Vec<ShardRouting>> = BTreeMap::new();
        for copy in &self.unassigned {
            unassigned
                .entry(copy.shard_id().clone())
                .or_default()
                .push(copy.clone());
        }
        for (shard_id, mut copies) in unassigned {
            copies.sort_by_key(|c| !c.primary());
            per_shard.entry(shard_id).or_default().extend(copies);
        }

        let indices = metadata
            .indices()
            .map(|meta| {
                let shards = (0..meta.number_of_shards)
                    .map(|id| {
                        let shard_id = ShardId::new(meta.name.clone(), id);
                        let copies = per_shard.remove(&shard_id).unwrap_or_default();
                        IndexShardRoutingTable::new(shard_id, copies)
                    })
                    .collect();
                let table = IndexRoutingTable::new(meta.name.clone(), shards);
                let table = match previous.index_arc(&meta.name) {
                    Some(prev) if **prev == table => prev.clone(),
                    _ => Arc::new(table),
                };
                (meta.name.clone(), table)
            })
            .collect();

        RoutingTable::from_indices(indices)
    }

    /// Check every routing invariant. A failure here is a bug, never bad input.
    pub fn validate(&self, metadata: &Metadata) -> Result<()> {
        for node_id in self.nodes.keys() {
            if !self.live.contains(node_id) {
                return Err(Error::InvariantViolation(format!(
                    "departed node [{}] still owns copies",
                    node_id
                )));
            }
        }

        let known = |shard_id: &ShardId| {
            metadata
                .index(&shard_id.index)
                .is_some_and(|m| shard_id.id < m.number_of_shards)
        };
        if let Some(stray) = self
            .assignments
            .keys()
            .chain(self.unassigned.iter().map(|u| u.shard_id()))
            .find(|id| !known(*id))
        {
            return Err(Error::InvariantViolation(format!(
                "copy of unknown shard {}",
                stray
            )));
        }

        for meta in metadata.indices() {
            for id in 0..meta.number_of_shards {
                let shard_id = ShardId::new(meta.name.clone(), id);
                self.validate_shard(&shard_id, meta.copies_per_shard())?;
            }
        }
        Ok(())
    }

    fn validate_shard(&self, shard_id: &ShardId, max_slots: usize) -> Result<()> {
        let copies = self.copies(shard_id);
        let slots: Vec<&ShardRouting> = copies
            .iter()
            .copied()
            .filter(|c| !c.is_relocation_target())
            .chain(self.unassigned.iter().filter(|u| u.shard_id() == shard_id))
            .collect();

        let primaries = slots.iter().filter(|c| c.primary()).count();
        if primaries != 1 {
            return Err(Error::InvariantViolation(format!(
                "{} has {} primaries",
                shard_id, primaries
            )));
        }
        if slots.len() > max_slots {
            return Err(Error::InvariantViolation(format!(
                "{} has {} copies, at most {} allowed",
                shard_id,
                slots.len(),
                max_slots
            )));
        }

        for copy in &copies {
            let node_id = copy.current_node_id().unwrap_or_default();
            let paired = match (copy.state(), copy.relocating_node_id()) {
                (ShardState::Relocating, Some(target)) => self
                    .copy_on(shard_id, target)
                    .is_some_and(|t| t.is_relocation_target() && t.relocating_node_id() == Some(node_id)),
                (ShardState::Initializing, Some(source)) => self
                    .copy_on(shard_id, source)
                    .is_some_and(|s| s.relocating() && s.relocating_node_id() == Some(node_id)),
                (ShardState::Relocating, None) => false,
                _ => true,
            };
            if !paired {
                return Err(Error::InvariantViolation(format!(
                    "{} has no matching relocation peer",
                    copy
                )));
            }
        }
        Ok(())
    }

    // === Internal index maintenance ===

    fn expect_copy(&self, shard_id: &ShardId, node_id: &str) -> Result<&ShardRouting> {
        self.copy_on(shard_id, node_id).ok_or_else(|| {
            Error::InvariantViolation(format!("{} has no copy on node [{}]", shard_id, node_id))
        })
    }

    fn add_copy(&mut self, copy: ShardRouting) -> Result<()> {
        let node_id = copy
            .current_node_id()
            .ok_or_else(|| Error::InvariantViolation(format!("{} is not assigned", copy)))?
            .to_string();
        let node = self
            .nodes
            .entry(node_id.clone())
            .or_insert_with(|| RoutingNode::new(&node_id));
        if let Some(existing) = node.shards.get(copy.shard_id()) {
            return Err(Error::InvariantViolation(format!(
                "node [{}] would hold two copies of {}: {} and {}",
                node_id,
                copy.shard_id(),
                existing,
                copy
            )));
        }
        self.assignments
            .entry(copy.shard_id().clone())
            .or_default()
            .insert(node_id);
        node.shards.insert(copy.shard_id().clone(), copy);
        Ok(())
    }

    fn replace_copy(&mut self, copy: ShardRouting) -> Result<()> {
        let node_id = copy.current_node_id().unwrap_or_default();
        let slot = self
            .nodes
            .get_mut(node_id)
            .and_then(|n| n.shards.get_mut(copy.shard_id()))
            .ok_or_else(|| {
                Error::InvariantViolation(format!("{} replaces a missing copy", copy))
            })?;
        *slot = copy;
        Ok(())
    }

    fn remove_copy(&mut self, shard_id: &ShardId, node_id: &str) -> Result<ShardRouting> {
        let copy = self
            .nodes
            .get_mut(node_id)
            .and_then(|n| n.shards.remove(shard_id))
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "{} has no copy on node [{}] to remove",
                    shard_id, node_id
                ))
            })?;
        if let Some(nodes) = self.assignments.get_mut(shard_id) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                self.assignments.remove(shard_id);
            }
        }
        Ok(copy)
    }
}
