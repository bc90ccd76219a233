use super::{AllocationDecider, Verdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// Replicas recover from the primary, so they wait until it is active.
pub struct ReplicaAfterPrimaryActiveDecider;

impl AllocationDecider for ReplicaAfterPrimaryActiveDecider {
    fn name(&self) -> &'static str {
        "replica_after_primary_active"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        if shard.primary() {
            return Verdict::yes(self.name(), "shard is primary");
        }
        match allocation.routing_nodes().active_primary(shard.shard_id()) {
            Some(_) => Verdict::yes(self.name(), "primary shard is active"),
            None => Verdict::no(self.name(), "primary shard is not active yet"),
        }
    }
}
