use super::{AllocationDecider, Verdict};
use crate::allocation::RoutingAllocation;
use crate::common::format_bytes;
use crate::routing::{DiskUsage, RoutingNode, ShardRouting};

/// Keeps copies off nodes whose disk is filling up.
///
/// Above the low watermark new copies are throttled; above the high
/// watermark they are refused and existing copies should move away.
/// Nodes that never reported disk usage are not constrained.
pub struct DiskThresholdDecider;

impl DiskThresholdDecider {
    fn usage(&self, node: &RoutingNode, allocation: &RoutingAllocation<'_>) -> Result<DiskUsage, Verdict> {
        if !allocation.settings().disk.enabled {
            return Err(Verdict::yes(self.name(), "disk threshold decider is disabled"));
        }
        allocation
            .disk_usage(node.node_id())
            .ok_or_else(|| Verdict::yes(self.name(), "node did not report disk usage"))
    }
}

fn describe(usage: &DiskUsage) -> String {
    format!(
        "{:.1}% used, {} free",
        usage.used_percent(),
        format_bytes(usage.free_bytes)
    )
}

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        "disk_threshold"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        let usage = match self.usage(node, allocation) {
            Ok(usage) => usage,
            Err(verdict) => return verdict,
        };
        let disk = &allocation.settings().disk;
        if disk.high_watermark.is_exceeded_by(&usage) {
            Verdict::no(
                self.name(),
                format!(
                    "node is above the high watermark [{}]: {}",
                    disk.high_watermark,
                    describe(&usage)
                ),
            )
        } else if disk.low_watermark.is_exceeded_by(&usage) {
            Verdict::throttle(
                self.name(),
                format!(
                    "node is above the low watermark [{}]: {}",
                    disk.low_watermark,
                    describe(&usage)
                ),
            )
        } else {
            Verdict::yes(self.name(), format!("enough disk space: {}", describe(&usage)))
        }
    }

    fn can_remain(
        &self,
        _shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        let usage = match self.usage(node, allocation) {
            Ok(usage) => usage,
            Err(verdict) => return verdict,
        };
        let high = &allocation.settings().disk.high_watermark;
        if high.is_exceeded_by(&usage) {
            Verdict::no(
                self.name(),
                format!("node is above the high watermark [{}]: {}", high, describe(&usage)),
            )
        } else {
            Verdict::yes(self.name(), "node is below the high watermark")
        }
    }
}
