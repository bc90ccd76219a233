//! Manual allocation commands

mod common;

use common::*;
use shardalloc::allocation::{
    AllocationCommand, AllocationService, CommandRejection, RerouteResult, RerouteTrigger,
};
use shardalloc::routing::{
    ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata, ShardState, ShardTransition, UnassignedReason,
};

fn run(service: &AllocationService, state: &ClusterState, commands: Vec<AllocationCommand>) -> RerouteResult {
    let trigger = commands
        .into_iter()
        .fold(RerouteTrigger::new("commands"), RerouteTrigger::with_command);
    service.reroute(state, trigger).unwrap()
}

fn move_cmd(id: u32, from: &str, to: &str) -> AllocationCommand {
    AllocationCommand::Move {
        shard_id: shard("test", id),
        from_node: from.into(),
        to_node: to.into(),
    }
}

fn cancel_cmd(id: u32, node: &str, allow_primary: bool) -> AllocationCommand {
    AllocationCommand::Cancel {
        shard_id: shard("test", id),
        node: node.into(),
        allow_primary,
    }
}

fn allocate_cmd(id: u32, node: &str, allow_primary: bool) -> AllocationCommand {
    AllocationCommand::Allocate {
        shard_id: shard("test", id),
        node: node.into(),
        allow_primary,
    }
}

/// Primary on node1, replica on node2, node3 empty.
fn three_nodes(service: &AllocationService) -> ClusterState {
    let state = converge(service, &cluster(&["node1", "node2", "node3"], &[IndexMetadata::new("test", 1, 1)]));
    assert!(copies_on(&state, "node3").is_empty());
    state
}

#[test]
fn test_move_starts_relocation() {
    let service = service();
    let state = three_nodes(&service);

    let result = run(&service, &state, vec![move_cmd(0, "node1", "node3")]);
    assert!(result.command_outcomes[0].is_applied());
    assert!(result.changed);

    let source = only_copy_on(&result.state, "node1");
    assert_eq!(source.state(), ShardState::Relocating);
    let target = only_copy_on(&result.state, "node3");
    assert!(target.primary());
    assert!(target.is_relocation_target());
    assert_eq!(result.recoveries.len(), 1);
    assert_eq!(result.recoveries[0].source_node.as_deref(), Some("node1"));

    let state = start_initializing(&service, &result.state).state;
    assert_eq!(primary_node(&state, &shard("test", 0)), "node3");
    assert!(copies_on(&state, "node1").is_empty());
}

#[test]
fn test_rejected_command_leaves_table_identical() {
    let service = service();
    let state = three_nodes(&service);

    let result = run(&service, &state, vec![move_cmd(0, "node1", "node2")]);
    assert_eq!(
        result.command_outcomes[0].result,
        Err(CommandRejection::AlreadyAllocated {
            shard_id: shard("test", 0),
            node: "node2".into(),
        })
    );
    assert!(!result.changed);
    assert_eq!(result.state.version(), state.version());
    assert_eq!(result.state.routing_table(), state.routing_table());
    assert_eq!(result.state.history(), state.history());
}

#[test]
fn test_unknown_targets_are_rejected() {
    let service = service();
    let state = three_nodes(&service);

    let result = run(
        &service,
        &state,
        vec![
            move_cmd(5, "node1", "node3"),
            move_cmd(0, "node1", "node9"),
            move_cmd(0, "node3", "node1"),
        ],
    );
    let results: Vec<_> = result.command_outcomes.iter().map(|o| o.result.clone()).collect();
    assert_eq!(
        results,
        vec![
            Err(CommandRejection::UnknownShard(shard("test", 5))),
            Err(CommandRejection::UnknownNode("node9".into())),
            Err(CommandRejection::NotOnNode {
                shard_id: shard("test", 0),
                node: "node3".into(),
            }),
        ]
    );
    assert!(!result.changed);
}

#[test]
fn test_move_of_recovering_copy_is_rejected() {
    let service = service();
    let state = three_nodes(&service);
    let state = run(&service, &state, vec![move_cmd(0, "node1", "node3")]).state;

    let result = run(&service, &state, vec![move_cmd(0, "node3", "node1")]);
    match &result.command_outcomes[0].result {
        Err(CommandRejection::InvalidState { state, action, .. }) => {
            assert_eq!(*state, ShardState::Initializing);
            assert_eq!(action, "move");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_commands_compose_in_order() {
    let service = service();
    let state = three_nodes(&service);

    let result = run(
        &service,
        &state,
        vec![move_cmd(0, "node1", "node3"), cancel_cmd(0, "node3", false)],
    );
    assert!(result.command_outcomes.iter().all(|o| o.is_applied()));
    assert!(result.transitions.contains(&ShardTransition::RelocationCancelled {
        shard_id: shard("test", 0),
        source: "node1".into(),
        target: "node3".into(),
    }));
    assert!(!result.changed);
    assert_eq!(result.state.routing_table(), state.routing_table());
}

#[test]
fn test_rejection_does_not_stop_later_commands() {
    let service = service();
    let state = three_nodes(&service);

    let result = run(
        &service,
        &state,
        vec![move_cmd(0, "node1", "node2"), move_cmd(0, "node2", "node3")],
    );
    assert!(!result.command_outcomes[0].is_applied());
    assert!(result.command_outcomes[1].is_applied());
    assert_eq!(only_copy_on(&result.state, "node2").state(), ShardState::Relocating);
}

#[test]
fn test_cancel_recovering_replica() {
    let service = service();
    let state = reroute(&service, &cluster(&["node1", "node2"], &[IndexMetadata::new("test", 1, 1)]));
    let state = start_initializing(&service, &state).state;
    assert_eq!(only_copy_on(&state, "node2").state(), ShardState::Initializing);

    let result = run(&service, &state, vec![cancel_cmd(0, "node2", false)]);
    assert!(result.command_outcomes[0].is_applied());
    assert!(result.transitions.contains(&ShardTransition::Unassigned {
        shard_id: shard("test", 0),
        node: "node2".into(),
        reason: UnassignedReason::RerouteCancelled,
    }));
}

#[test]
fn test_cancel_primary_requires_allow_primary() {
    let service = service();
    let state = reroute(&service, &cluster(&["node1"], &[IndexMetadata::new("test", 1, 0)]));

    let refused = run(&service, &state, vec![cancel_cmd(0, "node1", false)]);
    assert_eq!(
        refused.command_outcomes[0].result,
        Err(CommandRejection::PrimaryNotAllowed(shard("test", 0)))
    );

    let accepted = run(&service, &state, vec![cancel_cmd(0, "node1", true)]);
    assert!(accepted.command_outcomes[0].is_applied());
}

#[test]
fn test_cancel_started_copy_is_rejected() {
    let service = service();
    let state = three_nodes(&service);

    let result = run(&service, &state, vec![cancel_cmd(0, "node2", false)]);
    match &result.command_outcomes[0].result {
        Err(CommandRejection::InvalidState { state, action, .. }) => {
            assert_eq!(*state, ShardState::Started);
            assert_eq!(action, "cancel");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_allocate_replica_on_joining_node() {
    let service = service();
    let state = converge(&service, &cluster(&["node1"], &[IndexMetadata::new("test", 1, 1)]));
    assert_eq!(count_in_state(&state, ShardState::Unassigned), 1);

    let joined = with_nodes(&state, &["node1", "node2"]);
    let result = run(&service, &joined, vec![allocate_cmd(0, "node2", false)]);
    assert!(result.command_outcomes[0].is_applied());
    let replica = only_copy_on(&result.state, "node2");
    assert!(!replica.primary());
    assert_eq!(replica.state(), ShardState::Initializing);

    let again = run(&service, &result.state, vec![allocate_cmd(0, "node2", false)]);
    assert_eq!(
        again.command_outcomes[0].result,
        Err(CommandRejection::NoUnassignedCopy(shard("test", 0)))
    );
}

#[test]
fn test_allocate_vetoed_by_disk_threshold() {
    let service = service();
    let nodes: DiscoveryNodes = [
        DiscoveryNode::new("node1").with_disk(100, 50),
        DiscoveryNode::new("node2").with_disk(100, 5),
    ]
    .into_iter()
    .collect();
    let state = ClusterState::new()
        .with_nodes(nodes)
        .with_index(IndexMetadata::new("test", 1, 1), chrono::Utc::now())
        .unwrap();
    let state = converge(&service, &state);
    assert_eq!(count_in_state(&state, ShardState::Unassigned), 1);

    let result = run(&service, &state, vec![allocate_cmd(0, "node2", false)]);
    match &result.command_outcomes[0].result {
        Err(CommandRejection::Vetoed { node, reasons, .. }) => {
            assert_eq!(node, "node2");
            assert!(reasons.contains("high watermark"), "{}", reasons);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_command_naming_departed_node() {
    let service = service();
    let state = converge(
        &service,
        &cluster(&["node1", "node2", "node3"], &[IndexMetadata::new("test", 3, 0)]),
    );
    assert_eq!(copies_on(&state, "node3").len(), 1);

    let result = run(&service, &with_nodes(&state, &["node1", "node2"]), vec![move_cmd(0, "node1", "node3")]);
    assert_eq!(
        result.command_outcomes[0].result,
        Err(CommandRejection::NodeNotLive("node3".into()))
    );
}

#[test]
fn test_commands_from_json() {
    let commands: Vec<AllocationCommand> = serde_json::from_str(
        r#"[
            {"type": "move", "shard_id": {"index": "test", "id": 0}, "from_node": "node1", "to_node": "node3"},
            {"type": "allocate", "shard_id": {"index": "test", "id": 1}, "node": "node2"},
            {"type": "cancel", "shard_id": {"index": "test", "id": 2}, "node": "node1", "allow_primary": true}
        ]"#,
    )
    .unwrap();
    assert_eq!(commands[0], move_cmd(0, "node1", "node3"));
    assert_eq!(commands[1], allocate_cmd(1, "node2", false));
    assert_eq!(commands[2], cancel_cmd(2, "node1", true));
    assert_eq!(commands[0].to_string(), "move [test][0] [node1] -> [node3]");
}
