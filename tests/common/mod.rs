//! Shared fixtures for the integration tests

#![allow(dead_code)]

use shardalloc::allocation::{AllocationService, RerouteResult, RerouteTrigger};
use shardalloc::common::{AllocationSettings, AllowRebalance};
use shardalloc::routing::{
    ClusterState, DiscoveryNodes, IndexMetadata, ShardId, ShardRouting, ShardState,
};
use std::collections::BTreeMap;

/// Settings used by the dead-node scenarios: generous recovery limits and
/// rebalancing allowed at any time.
pub fn relaxed_settings() -> AllocationSettings {
    let mut settings = AllocationSettings::default();
    settings.node_concurrent_recoveries = 10;
    settings.rebalance.allow = AllowRebalance::Always;
    settings
}

pub fn service() -> AllocationService {
    AllocationService::new(AllocationSettings::default())
}

pub fn service_with(configure: impl FnOnce(&mut AllocationSettings)) -> AllocationService {
    let mut settings = AllocationSettings::default();
    configure(&mut settings);
    AllocationService::new(settings)
}

pub fn cluster(nodes: &[&str], indices: &[IndexMetadata]) -> ClusterState {
    let mut state = ClusterState::new().with_nodes(DiscoveryNodes::from_ids(nodes.iter().copied()));
    for meta in indices {
        state = state.with_index(meta.clone(), chrono::Utc::now()).unwrap();
    }
    state
}

pub fn shard(index: &str, id: u32) -> ShardId {
    ShardId::new(index, id)
}

pub fn reroute(service: &AllocationService, state: &ClusterState) -> ClusterState {
    service.reroute(state, RerouteTrigger::new("test")).unwrap().state
}

pub fn with_nodes(state: &ClusterState, nodes: &[&str]) -> ClusterState {
    state.with_nodes(DiscoveryNodes::from_ids(nodes.iter().copied()))
}

/// Every copy held by `node_id`, relocation targets included.
pub fn copies_on(state: &ClusterState, node_id: &str) -> Vec<ShardRouting> {
    let mut copies = Vec::new();
    for copy in state.routing_table().copies() {
        if copy.current_node_id() == Some(node_id) {
            copies.push(copy.clone());
        } else if copy.relocating_node_id() == Some(node_id) {
            copies.extend(copy.relocation_target());
        }
    }
    copies
}

/// The single copy held by `node_id`.
pub fn only_copy_on(state: &ClusterState, node_id: &str) -> ShardRouting {
    let copies = copies_on(state, node_id);
    assert_eq!(copies.len(), 1, "expected one copy on {}: {:?}", node_id, copies);
    copies.into_iter().next().unwrap()
}

pub fn primary_node(state: &ClusterState, shard_id: &ShardId) -> String {
    state
        .routing_table()
        .shard(shard_id)
        .and_then(|s| s.primary())
        .and_then(|p| p.current_node_id())
        .map(String::from)
        .expect("primary is assigned")
}

pub fn replica_node(state: &ClusterState, shard_id: &ShardId) -> String {
    state
        .routing_table()
        .shard(shard_id)
        .and_then(|s| s.replicas().next())
        .and_then(|r| r.current_node_id())
        .map(String::from)
        .expect("replica is assigned")
}

/// Report every initializing copy (relocation targets too) as started.
pub fn start_initializing(service: &AllocationService, state: &ClusterState) -> RerouteResult {
    let mut trigger = RerouteTrigger::new("start initializing");
    for copy in state.routing_table().copies() {
        match copy.state() {
            ShardState::Initializing => {
                trigger = trigger.with_started(copy.shard_id().clone(), copy.current_node_id().unwrap());
            }
            ShardState::Relocating => {
                trigger = trigger.with_started(copy.shard_id().clone(), copy.relocating_node_id().unwrap());
            }
            _ => {}
        }
    }
    service.reroute(state, trigger).unwrap()
}

/// Reroute and start recoveries until nothing is in flight.
pub fn converge(service: &AllocationService, state: &ClusterState) -> ClusterState {
    let mut state = reroute(service, state);
    for _ in 0..100 {
        let in_flight = state.routing_table().copies().any(|c| c.initializing() || c.relocating());
        if !in_flight {
            return state;
        }
        state = start_initializing(service, &state).state;
        assert_no_double_assignment(&state);
    }
    panic!("cluster did not converge");
}

/// No node holds two copies of one shard, relocation targets included.
pub fn assert_no_double_assignment(state: &ClusterState) {
    let mut seen: BTreeMap<(ShardId, String), usize> = BTreeMap::new();
    for copy in state.routing_table().copies() {
        for node in [copy.current_node_id(), copy.relocating_node_id()].into_iter().flatten() {
            *seen.entry((copy.shard_id().clone(), node.to_string())).or_default() += 1;
        }
    }
    for ((shard_id, node), count) in seen {
        assert_eq!(count, 1, "{} has {} copies on {}", shard_id, count, node);
    }
}

/// Copies per live node, relocating sources excluded.
pub fn node_weights(state: &ClusterState) -> BTreeMap<String, usize> {
    state
        .nodes()
        .ids()
        .map(|id| {
            let weight = copies_on(state, id).iter().filter(|c| !c.relocating()).count();
            (id.to_string(), weight)
        })
        .collect()
}

pub fn count_in_state(state: &ClusterState, shard_state: ShardState) -> usize {
    state.routing_table().copies_with_state(shard_state).len()
}
