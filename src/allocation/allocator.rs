//! Placement passes: allocate unassigned copies, replenish missing replicas,
//! move copies off nodes they may not remain on, and rebalance.
//!
//! Candidate nodes are always visited in the same order: fewest copies
//! first (relocating sources excluded), then node id. The first YES wins.

use crate::allocation::decider::{AllocationDeciders, Decision, NodeDecision};
use crate::allocation::explain::AllocationAttempt;
use crate::allocation::RoutingAllocation;
use crate::common::Result;
use crate::routing::{ShardId, ShardRouting, UnassignedInfo, UnassignedReason};
use std::cmp::Reverse;
use tracing::{debug, info};

/// Live node ids in allocation order.
pub fn candidate_nodes(allocation: &RoutingAllocation<'_>) -> Vec<String> {
    let mut nodes: Vec<(usize, &str)> = allocation
        .routing_nodes()
        .live_nodes()
        .map(|n| (n.weight(), n.node_id()))
        .collect();
    nodes.sort();
    nodes.into_iter().map(|(_, id)| id.to_string()).collect()
}

/// Outcome of looking for a node for one copy.
enum Placement {
    Node(String),
    Deferred(Vec<NodeDecision>),
    Refused(Vec<NodeDecision>),
}

fn find_node(
    allocation: &RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    copy: &ShardRouting,
    exclude: Option<&str>,
) -> Placement {
    let mut decisions = Vec::new();
    for node_id in candidate_nodes(allocation) {
        if exclude == Some(node_id.as_str()) {
            continue;
        }
        let Some(node) = allocation.routing_nodes().node(&node_id) else {
            continue;
        };
        let decision = deciders.can_allocate(copy, node, allocation, false);
        if decision.decision == Decision::Yes {
            return Placement::Node(node_id);
        }
        decisions.push(decision);
    }
    if decisions.iter().any(|d| d.decision == Decision::Throttle) {
        Placement::Deferred(decisions)
    } else {
        Placement::Refused(decisions)
    }
}

/// Place unassigned copies: primaries before replicas, then shard id order.
///
/// A primary whose active copy was lost is skipped; only an explicit
/// allocate command may bring it back empty.
pub fn allocate_unassigned(allocation: &mut RoutingAllocation<'_>, deciders: &AllocationDeciders) -> Result<()> {
    let mut pending: Vec<ShardRouting> = allocation.routing_nodes().unassigned().to_vec();
    pending.sort_by(|a, b| {
        b.primary()
            .cmp(&a.primary())
            .then_with(|| a.shard_id().cmp(b.shard_id()))
    });

    for copy in pending {
        if copy.primary()
            && copy
                .unassigned_info()
                .is_some_and(|info| info.lost_active_copy)
        {
            debug!(shard = %copy.shard_id(), "Primary data lost, waiting for an explicit allocation");
            continue;
        }

        match find_node(allocation, deciders, &copy, None) {
            Placement::Node(node_id) => {
                debug!(shard = %copy.shard_id(), node = %node_id, primary = copy.primary(), "Allocating");
                allocation.routing_nodes_mut().initialize(&copy, &node_id)?;
            }
            Placement::Deferred(nodes) => {
                debug!(shard = %copy.shard_id(), primary = copy.primary(), "Allocation throttled");
                record(allocation, copy.shard_id(), copy.primary(), Decision::Throttle, nodes);
            }
            Placement::Refused(nodes) => {
                debug!(shard = %copy.shard_id(), primary = copy.primary(), "No node accepts the copy");
                record(allocation, copy.shard_id(), copy.primary(), Decision::No, nodes);
            }
        }
    }
    Ok(())
}

fn record(
    allocation: &mut RoutingAllocation<'_>,
    shard_id: &ShardId,
    primary: bool,
    outcome: Decision,
    nodes: Vec<NodeDecision>,
) {
    allocation.history_mut().record(
        shard_id,
        AllocationAttempt {
            primary,
            outcome,
            nodes,
        },
    );
}

/// Recreate replica slots dropped when a replica was promoted. A missing
/// copy is only created when a node accepts it right away.
pub fn replenish_replicas(allocation: &mut RoutingAllocation<'_>, deciders: &AllocationDeciders) -> Result<()> {
    let metadata = allocation.state().metadata();
    for meta in metadata.indices() {
        for id in 0..meta.number_of_shards {
            let shard_id = ShardId::new(meta.name.clone(), id);
            let mut missing = meta
                .copies_per_shard()
                .saturating_sub(allocation.routing_nodes().slot_count(&shard_id));

            while missing > 0 {
                let replica = ShardRouting::new_unassigned(
                    shard_id.clone(),
                    false,
                    UnassignedInfo::new(UnassignedReason::ReplicaAdded, allocation.at()),
                );
                let Placement::Node(node_id) = find_node(allocation, deciders, &replica, None) else {
                    debug!(shard = %shard_id, missing, "Cannot rebuild missing replicas yet");
                    break;
                };
                info!(shard = %shard_id, node = %node_id, "Rebuilding missing replica");
                let routing_nodes = allocation.routing_nodes_mut();
                routing_nodes.add_unassigned(replica.clone())?;
                routing_nodes.initialize(&replica, &node_id)?;
                missing -= 1;
            }
        }
    }
    Ok(())
}

/// Relocate started copies that may not remain on their node.
pub fn move_shards(allocation: &mut RoutingAllocation<'_>, deciders: &AllocationDeciders) -> Result<()> {
    let nodes: Vec<String> = allocation
        .routing_nodes()
        .live_nodes()
        .map(|n| n.node_id().to_string())
        .collect();

    for node_id in nodes {
        let started: Vec<ShardRouting> = allocation
            .routing_nodes()
            .node(&node_id)
            .map(|n| n.shards().filter(|s| s.started()).cloned().collect())
            .unwrap_or_default();

        for copy in started {
            let Some(node) = allocation.routing_nodes().node(&node_id) else {
                break;
            };
            let remain = deciders.can_remain(&copy, node, allocation, false);
            if remain.decision != Decision::No {
                continue;
            }
            match find_node(allocation, deciders, &copy, Some(&node_id)) {
                Placement::Node(target) => {
                    info!(shard = %copy.shard_id(), from = %node_id, to = %target, reason = %remain.reasons(), "Moving copy off node");
                    allocation
                        .routing_nodes_mut()
                        .relocate(copy.shard_id(), &node_id, &target)?;
                }
                _ => {
                    debug!(shard = %copy.shard_id(), node = %node_id, "Copy cannot remain but has nowhere to go");
                }
            }
        }
    }
    Ok(())
}

/// Move started copies from the most loaded to the least loaded nodes while
/// the spread exceeds the threshold. Each move narrows the spread between
/// two nodes that differ by at least two copies, so the loop terminates.
pub fn rebalance(allocation: &mut RoutingAllocation<'_>, deciders: &AllocationDeciders) -> Result<()> {
    let threshold = f64::from(allocation.settings().rebalance.threshold).max(1.0);
    let mut moves = 0usize;

    while deciders.can_rebalance_cluster(allocation) == Decision::Yes {
        match find_rebalance_move(allocation, deciders, threshold) {
            Some((shard_id, from, to)) => {
                debug!(shard = %shard_id, from = %from, to = %to, "Rebalancing");
                allocation
                    .routing_nodes_mut()
                    .relocate(&shard_id, &from, &to)?;
                moves += 1;
            }
            None => break,
        }
    }
    if moves > 0 {
        info!(moves, "Rebalance started relocations");
    }
    Ok(())
}

fn find_rebalance_move(
    allocation: &RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    threshold: f64,
) -> Option<(ShardId, String, String)> {
    let routing_nodes = allocation.routing_nodes();
    let mut by_weight: Vec<(usize, &str)> = routing_nodes
        .live_nodes()
        .map(|n| (n.weight(), n.node_id()))
        .collect();
    by_weight.sort();

    let mut heaviest = by_weight.clone();
    heaviest.sort_by_key(|&(weight, id)| (Reverse(weight), id));

    for &(from_weight, from) in &heaviest {
        for &(to_weight, to) in &by_weight {
            if (from_weight.saturating_sub(to_weight) as f64) <= threshold {
                break;
            }
            let (Some(source), Some(target)) = (routing_nodes.node(from), routing_nodes.node(to)) else {
                continue;
            };
            let movable = source.shards().filter(|s| s.started()).find(|s| {
                deciders.can_rebalance_shard(s, allocation) == Decision::Yes
                    && deciders.can_allocate(s, target, allocation, false).decision == Decision::Yes
            });
            if let Some(copy) = movable {
                return Some((copy.shard_id().clone(), from.to_string(), to.to_string()));
            }
        }
    }
    None
}
