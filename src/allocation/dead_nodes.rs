//! Reconciliation of copies held by nodes that left the cluster
//!
//! Only forgets copies or reverts moves. Where replacement copies go is
//! decided later in the pass by the allocator.

use crate::allocation::RoutingAllocation;
use crate::common::{Error, Result};
use crate::routing::{ShardId, ShardRouting, UnassignedInfo, UnassignedReason};
use tracing::{debug, info};

/// Reconcile every departed node, in node id order.
pub fn reconcile(allocation: &mut RoutingAllocation<'_>) -> Result<()> {
    for node_id in allocation.routing_nodes().departed_node_ids() {
        let shard_ids: Vec<ShardId> = allocation
            .routing_nodes()
            .node(&node_id)
            .map(|n| n.shards().map(|s| s.shard_id().clone()).collect())
            .unwrap_or_default();
        info!(node = %node_id, copies = shard_ids.len(), "Reconciling departed node");

        for shard_id in shard_ids {
            // an earlier copy may already have taken this one with it
            let Some(copy) = allocation
                .routing_nodes()
                .copy_on(&shard_id, &node_id)
                .cloned()
            else {
                continue;
            };
            reconcile_copy(allocation, &copy, &node_id)?;
        }
        allocation.routing_nodes_mut().remove_node(&node_id)?;
    }
    Ok(())
}

fn reconcile_copy(allocation: &mut RoutingAllocation<'_>, copy: &ShardRouting, node_id: &str) -> Result<()> {
    let shard_id = copy.shard_id();

    if copy.is_relocation_target() {
        let source = copy.relocating_node_id().unwrap_or_default().to_string();
        if allocation.routing_nodes().is_live(&source) {
            debug!(shard = %shard_id, source = %source, target = %node_id, "Relocation target left, source keeps its copy");
            return allocation
                .routing_nodes_mut()
                .cancel_relocation(shard_id, &source);
        }

        // both ends are gone: the source copy is lost along with the move
        let source_copy = allocation
            .routing_nodes()
            .copy_on(shard_id, &source)
            .cloned()
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "relocation target {} has no source on [{}]",
                    copy, source
                ))
            })?;
        return lose_copy(
            allocation,
            &source_copy,
            &source,
            UnassignedReason::RelocationAbandoned,
            format!("node [{}] left while relocating to [{}]", source, node_id),
        );
    }

    let (reason, message) = if copy.relocating() {
        (
            UnassignedReason::RelocationAbandoned,
            format!(
                "node [{}] left while relocating to [{}]",
                node_id,
                copy.relocating_node_id().unwrap_or_default()
            ),
        )
    } else {
        (
            UnassignedReason::NodeLeft,
            format!("node [{}] left the cluster", node_id),
        )
    };
    lose_copy(allocation, copy, node_id, reason, message)
}

/// Forget a copy held by a departed node.
///
/// A replica leaves an unassigned slot. A primary hands over to an active
/// replica on a live node when there is one and leaves no slot behind;
/// otherwise it becomes an unassigned primary.
fn lose_copy(
    allocation: &mut RoutingAllocation<'_>,
    copy: &ShardRouting,
    node_id: &str,
    reason: UnassignedReason,
    message: String,
) -> Result<()> {
    let shard_id = copy.shard_id().clone();
    let info = UnassignedInfo::new(reason, allocation.at()).with_message(message);

    if !copy.primary() {
        debug!(shard = %shard_id, node = %node_id, reason = %reason, "Replica lost");
        return allocation
            .routing_nodes_mut()
            .move_to_unassigned(&shard_id, node_id, info);
    }

    fail_initializing_replicas(allocation, &shard_id, "primary left the cluster")?;

    let routing_nodes = allocation.routing_nodes();
    let has_live_replica = routing_nodes.copies(&shard_id).iter().any(|c| {
        !c.primary()
            && c.active()
            && c.current_node_id().is_some_and(|n| routing_nodes.is_live(n))
    });

    let routing_nodes = allocation.routing_nodes_mut();
    if has_live_replica {
        routing_nodes.drop_copy(&shard_id, node_id)?;
        let promoted = routing_nodes.promote_active_replica(&shard_id)?;
        info!(shard = %shard_id, departed = %node_id, promoted = ?promoted, "Primary lost, replica promoted");
    } else {
        info!(shard = %shard_id, node = %node_id, "Primary lost with no active replica");
        routing_nodes.move_to_unassigned(&shard_id, node_id, info)?;
    }
    Ok(())
}

/// Unassign every replica recovering from the shard's primary. Called when
/// the primary goes away, since those recoveries have lost their source.
pub(crate) fn fail_initializing_replicas(
    allocation: &mut RoutingAllocation<'_>,
    shard_id: &ShardId,
    message: &str,
) -> Result<()> {
    let recovering: Vec<String> = allocation
        .routing_nodes()
        .copies(shard_id)
        .into_iter()
        .filter(|c| !c.primary() && c.initializing() && !c.is_relocation_target())
        .filter_map(|c| c.current_node_id().map(String::from))
        .collect();

    for node_id in recovering {
        debug!(shard = %shard_id, node = %node_id, "Failing replica recovery, primary is gone");
        let info = UnassignedInfo::new(UnassignedReason::PrimaryFailed, allocation.at())
            .with_message(message);
        allocation
            .routing_nodes_mut()
            .move_to_unassigned(shard_id, &node_id, info)?;
    }
    Ok(())
}
