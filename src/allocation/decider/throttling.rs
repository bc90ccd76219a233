use super::{AllocationDecider, Verdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting, ShardState};

/// Per-node recovery limits.
///
/// A fresh primary (nothing to recover from) counts against
/// `node_initial_primaries_recoveries`. Every other copy counts against
/// `node_concurrent_recoveries` on both the receiving node and the node it
/// recovers from.
pub struct ThrottlingDecider;

impl AllocationDecider for ThrottlingDecider {
    fn name(&self) -> &'static str {
        "throttling"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        let settings = allocation.settings();
        let routing_nodes = allocation.routing_nodes();

        if shard.primary() && shard.unassigned() {
            let initializing = routing_nodes.initializing_primaries(node.node_id());
            let limit = settings.node_initial_primaries_recoveries;
            return if initializing >= limit {
                Verdict::throttle(
                    self.name(),
                    format!(
                        "{} primaries already initializing on this node, limit {}",
                        initializing, limit
                    ),
                )
            } else {
                Verdict::yes(self.name(), "below the primaries recovery limit")
            };
        }

        let limit = settings.node_concurrent_recoveries;
        let incoming = routing_nodes.incoming_recoveries(node.node_id());
        if incoming >= limit {
            return Verdict::throttle(
                self.name(),
                format!(
                    "{} incoming recoveries on this node, limit {}",
                    incoming, limit
                ),
            );
        }

        let source = if shard.unassigned() {
            routing_nodes
                .active_primary(shard.shard_id())
                .and_then(|p| p.current_node_id())
        } else {
            shard.current_node_id()
        };
        if let Some(source) = source {
            let outgoing = routing_nodes.outgoing_recoveries(source);
            if outgoing >= limit {
                return Verdict::throttle(
                    self.name(),
                    format!(
                        "{} outgoing recoveries on source node [{}], limit {}",
                        outgoing, source, limit
                    ),
                );
            }
        }
        Verdict::yes(self.name(), "below the node recovery limits")
    }
}

/// Cluster-wide cap on initializing copies.
pub struct ConcurrentRecoveriesDecider;

impl AllocationDecider for ConcurrentRecoveriesDecider {
    fn name(&self) -> &'static str {
        "concurrent_recoveries"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        let limit = allocation.settings().cluster_concurrent_recoveries;
        let initializing = allocation
            .routing_nodes()
            .count_in_state(ShardState::Initializing);
        if initializing >= limit {
            Verdict::throttle(
                self.name(),
                format!(
                    "{} copies initializing in the cluster, limit {}",
                    initializing, limit
                ),
            )
        } else {
            Verdict::yes(self.name(), "below the cluster recovery limit")
        }
    }
}
