use super::{AllocationDecider, Verdict};
use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};

/// Never two copies of one shard on the same node.
pub struct SameShardDecider;

impl AllocationDecider for SameShardDecider {
    fn name(&self) -> &'static str {
        "same_shard"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        match node.shard(shard.shard_id()) {
            Some(existing) => Verdict::no(
                self.name(),
                format!(
                    "a copy of {} is already allocated to this node ({})",
                    shard.shard_id(),
                    existing
                ),
            ),
            None => Verdict::yes(self.name(), "no copy of this shard on the node"),
        }
    }
}
