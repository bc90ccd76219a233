//! Copies held by nodes that leave the cluster

mod common;

use common::*;
use shardalloc::allocation::{AllocationCommand, AllocationService, CommandRejection, RerouteTrigger};
use shardalloc::routing::{ClusterHealth, ClusterState, HealthStatus, IndexMetadata, ShardState, ShardTransition, UnassignedReason};

fn relaxed() -> AllocationService {
    AllocationService::new(relaxed_settings())
}

/// Two started copies of `test[0]`: primary on node1, replica on node2.
fn started_pair(service: &AllocationService, nodes: &[&str]) -> ClusterState {
    let state = converge(service, &cluster(nodes, &[IndexMetadata::new("test", 1, 1)]));
    assert_eq!(primary_node(&state, &shard("test", 0)), "node1");
    assert_eq!(replica_node(&state, &shard("test", 0)), "node2");
    assert_eq!(count_in_state(&state, ShardState::Started), 2);
    state
}

fn move_primary(service: &AllocationService, state: &ClusterState, to: &str) -> ClusterState {
    let result = service
        .reroute(
            state,
            RerouteTrigger::new("move").with_command(AllocationCommand::Move {
                shard_id: shard("test", 0),
                from_node: "node1".into(),
                to_node: to.into(),
            }),
        )
        .unwrap();
    assert!(result.command_outcomes[0].is_applied());
    result.state
}

#[test]
fn test_simple_dead_node_on_started_primary_shard() {
    let service = relaxed();
    let state = started_pair(&service, &["node1", "node2"]);

    let result = service
        .reroute(&with_nodes(&state, &["node2"]), RerouteTrigger::new("node1 left"))
        .unwrap();
    assert!(result.changed);

    let promoted = only_copy_on(&result.state, "node2");
    assert!(promoted.primary());
    assert_eq!(promoted.state(), ShardState::Started);
    assert!(copies_on(&result.state, "node1").is_empty());
    // promotion does not move anything
    assert!(result.recoveries.is_empty());
    assert!(result.transitions.contains(&ShardTransition::Promoted {
        shard_id: shard("test", 0),
        node: "node2".into(),
    }));

    let health = ClusterHealth::of(&result.state);
    assert_eq!(health.status, HealthStatus::Yellow);
    assert_eq!(health.missing, 1);
}

#[test]
fn test_dead_node_while_relocating_on_to_node() {
    let service = relaxed();
    let state = started_pair(&service, &["node1", "node2"]);
    let state = with_nodes(&state, &["node1", "node2", "node3"]);
    let state = reroute(&service, &state);
    assert!(copies_on(&state, "node3").is_empty());

    let state = move_primary(&service, &state, "node3");
    assert_eq!(only_copy_on(&state, "node1").state(), ShardState::Relocating);
    assert_eq!(only_copy_on(&state, "node3").state(), ShardState::Initializing);

    let state = reroute(&service, &with_nodes(&state, &["node1", "node2"]));
    let primary = only_copy_on(&state, "node1");
    assert!(primary.primary());
    assert_eq!(primary.state(), ShardState::Started);
    assert_eq!(only_copy_on(&state, "node2").state(), ShardState::Started);
    assert_eq!(count_in_state(&state, ShardState::Started), 2);
}

#[test]
fn test_dead_node_while_relocating_on_from_node() {
    let service = relaxed();
    let state = started_pair(&service, &["node1", "node2"]);
    let state = reroute(&service, &with_nodes(&state, &["node1", "node2", "node3"]));
    let state = move_primary(&service, &state, "node3");

    let result = service
        .reroute(&with_nodes(&state, &["node3", "node2"]), RerouteTrigger::new("node1 left"))
        .unwrap();
    let state = result.state;

    let promoted = only_copy_on(&state, "node2");
    assert!(promoted.primary());
    assert_eq!(promoted.state(), ShardState::Started);

    // the abandoned target is gone and a fresh replica recovers from the new primary
    let replica = only_copy_on(&state, "node3");
    assert!(!replica.primary());
    assert_eq!(replica.state(), ShardState::Initializing);
    assert_eq!(result.recoveries.len(), 1);
    assert_eq!(result.recoveries[0].source_node.as_deref(), Some("node2"));
    assert_eq!(result.recoveries[0].target_node, "node3");
    assert_no_double_assignment(&state);
}

#[test]
fn test_source_death_without_replica_loses_primary() {
    let service = relaxed();
    let state = converge(&service, &cluster(&["node1", "node2"], &[IndexMetadata::new("test", 1, 0)]));
    assert_eq!(primary_node(&state, &shard("test", 0)), "node1");

    let state = move_primary(&service, &state, "node2");
    let state = reroute(&service, &with_nodes(&state, &["node2"]));

    let copies = state.routing_table().shard(&shard("test", 0)).unwrap().copies().to_vec();
    assert_eq!(copies.len(), 1);
    assert!(copies[0].primary());
    assert!(copies[0].unassigned());
    let info = copies[0].unassigned_info().unwrap();
    assert_eq!(info.reason, UnassignedReason::RelocationAbandoned);
    assert!(info.lost_active_copy);
    assert!(copies_on(&state, "node2").is_empty());
    assert_eq!(ClusterHealth::of(&state).status, HealthStatus::Red);
}

#[test]
fn test_target_death_without_replica_keeps_source() {
    let service = relaxed();
    let state = converge(&service, &cluster(&["node1", "node2"], &[IndexMetadata::new("test", 1, 0)]));
    let state = move_primary(&service, &state, "node2");

    let state = reroute(&service, &with_nodes(&state, &["node1"]));
    let primary = only_copy_on(&state, "node1");
    assert_eq!(primary.state(), ShardState::Started);
    assert_eq!(primary.relocating_node_id(), None);
    assert_eq!(ClusterHealth::of(&state).status, HealthStatus::Green);
}

#[test]
fn test_both_relocation_ends_die() {
    let service = relaxed();
    let state = started_pair(&service, &["node1", "node2", "node3"]);
    let state = move_primary(&service, &state, "node3");

    let state = reroute(&service, &with_nodes(&state, &["node2"]));
    let promoted = only_copy_on(&state, "node2");
    assert!(promoted.primary());
    assert_eq!(promoted.state(), ShardState::Started);
    assert_eq!(state.routing_table().copies().count(), 1);
    assert!(state.routing_table().referenced_nodes().iter().all(|n| n == "node2"));
}

#[test]
fn test_replica_on_dead_node_is_reallocated() {
    let service = relaxed();
    let state = started_pair(&service, &["node1", "node2", "node3"]);

    let result = service
        .reroute(&with_nodes(&state, &["node1", "node3"]), RerouteTrigger::new("node2 left"))
        .unwrap();
    assert!(result.transitions.contains(&ShardTransition::Unassigned {
        shard_id: shard("test", 0),
        node: "node2".into(),
        reason: UnassignedReason::NodeLeft,
    }));
    assert_eq!(only_copy_on(&result.state, "node1").state(), ShardState::Started);
    let replica = only_copy_on(&result.state, "node3");
    assert!(!replica.primary());
    assert_eq!(replica.state(), ShardState::Initializing);
}

#[test]
fn test_lost_primary_needs_explicit_allocation() {
    let service = relaxed();
    let state = converge(&service, &cluster(&["node1", "node2"], &[IndexMetadata::new("test", 1, 0)]));
    let state = reroute(&service, &with_nodes(&state, &["node2"]));

    // more passes never bring it back on their own
    let again = service.reroute(&state, RerouteTrigger::new("again")).unwrap();
    assert!(!again.changed);
    assert_eq!(count_in_state(&again.state, ShardState::Unassigned), 1);

    let refused = service
        .reroute(
            &state,
            RerouteTrigger::new("allocate").with_command(AllocationCommand::Allocate {
                shard_id: shard("test", 0),
                node: "node2".into(),
                allow_primary: false,
            }),
        )
        .unwrap();
    assert_eq!(
        refused.command_outcomes[0].result,
        Err(CommandRejection::PrimaryNotAllowed(shard("test", 0)))
    );
    assert!(!refused.changed);

    let accepted = service
        .reroute(
            &state,
            RerouteTrigger::new("allocate").with_command(AllocationCommand::Allocate {
                shard_id: shard("test", 0),
                node: "node2".into(),
                allow_primary: true,
            }),
        )
        .unwrap();
    assert!(accepted.command_outcomes[0].is_applied());
    let primary = only_copy_on(&accepted.state, "node2");
    assert!(primary.primary());
    assert_eq!(primary.state(), ShardState::Initializing);
    assert_eq!(accepted.recoveries[0].source_node, None);
}

#[test]
fn test_departed_node_without_copies_changes_nothing() {
    let service = relaxed();
    let state = started_pair(&service, &["node1", "node2", "node3"]);
    let next = with_nodes(&state, &["node1", "node2"]);
    let result = service.reroute(&next, RerouteTrigger::new("node3 left")).unwrap();
    assert!(!result.changed);
    assert_eq!(result.state.routing_table(), state.routing_table());
}
