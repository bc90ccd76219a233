use super::{AllocationDecider, Verdict};
use crate::allocation::RoutingAllocation;
use crate::common::{AllowRebalance, RebalanceMode};
use crate::routing::{ShardRouting, ShardState};

/// `rebalance.enable`: which copies the rebalancer may move.
pub struct EnableRebalanceDecider;

impl AllocationDecider for EnableRebalanceDecider {
    fn name(&self) -> &'static str {
        "enable_rebalance"
    }

    fn can_rebalance_shard(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Verdict {
        let mode = allocation.settings().rebalance.enable;
        let allowed = match mode {
            RebalanceMode::All => true,
            RebalanceMode::None => false,
            RebalanceMode::Primaries => shard.primary(),
            RebalanceMode::Replicas => !shard.primary(),
        };
        if allowed {
            Verdict::yes(self.name(), format!("rebalancing allowed for mode [{}]", mode))
        } else {
            Verdict::no(self.name(), format!("rebalancing disallowed for mode [{}]", mode))
        }
    }
}

/// `rebalance.allow`: how settled the cluster must be before rebalancing.
pub struct ClusterRebalanceDecider;

impl AllocationDecider for ClusterRebalanceDecider {
    fn name(&self) -> &'static str {
        "cluster_rebalance"
    }

    fn can_rebalance_cluster(&self, allocation: &RoutingAllocation<'_>) -> Verdict {
        let routing_nodes = allocation.routing_nodes();
        match allocation.settings().rebalance.allow {
            AllowRebalance::Always => Verdict::yes(self.name(), "rebalancing is always allowed"),
            AllowRebalance::IndicesPrimariesActive => {
                let inactive_primary = routing_nodes.unassigned().iter().any(|u| u.primary())
                    || routing_nodes.live_nodes().any(|n| {
                        n.shards()
                            .any(|s| s.primary() && s.initializing() && !s.is_relocation_target())
                    });
                if inactive_primary {
                    Verdict::no(self.name(), "not all primaries are active")
                } else {
                    Verdict::yes(self.name(), "all primaries are active")
                }
            }
            AllowRebalance::IndicesAllActive => {
                let inactive = !routing_nodes.unassigned().is_empty()
                    || routing_nodes.count_in_state(ShardState::Initializing) > 0;
                if inactive {
                    Verdict::no(self.name(), "not all shard copies are active")
                } else {
                    Verdict::yes(self.name(), "all shard copies are active")
                }
            }
        }
    }
}

/// `cluster_concurrent_rebalance`: in-flight relocation cap.
pub struct ConcurrentRebalanceDecider;

impl AllocationDecider for ConcurrentRebalanceDecider {
    fn name(&self) -> &'static str {
        "concurrent_rebalance"
    }

    fn can_rebalance_cluster(&self, allocation: &RoutingAllocation<'_>) -> Verdict {
        let limit = allocation.settings().cluster_concurrent_rebalance;
        let relocating = allocation
            .routing_nodes()
            .count_in_state(ShardState::Relocating);
        if relocating >= limit {
            Verdict::throttle(
                self.name(),
                format!("{} relocations in flight, limit {}", relocating, limit),
            )
        } else {
            Verdict::yes(self.name(), "below the concurrent rebalance limit")
        }
    }
}
