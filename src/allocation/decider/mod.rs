//! Allocation deciders
//!
//! A decider is a named placement constraint. It only reads the working
//! view and answers YES, THROTTLE or NO for a (copy, node) pair. The
//! combined answer for a node is the worst answer of any decider.

mod disk;
mod rebalance;
mod replica_after_primary;
mod same_shard;
mod throttling;

pub use disk::DiskThresholdDecider;
pub use rebalance::{ClusterRebalanceDecider, ConcurrentRebalanceDecider, EnableRebalanceDecider};
pub use replica_after_primary::ReplicaAfterPrimaryActiveDecider;
pub use same_shard::SameShardDecider;
pub use throttling::{ConcurrentRecoveriesDecider, ThrottlingDecider};

use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Ordered so that `max` is the worst-of combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Yes,
    Throttle,
    No,
}

impl Decision {
    pub fn worst(self, other: Decision) -> Decision {
        self.max(other)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Yes => write!(f, "YES"),
            Decision::Throttle => write!(f, "THROTTLE"),
            Decision::No => write!(f, "NO"),
        }
    }
}

/// One decider's answer and its explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub decider: &'static str,
    pub decision: Decision,
    pub reason: String,
}

impl Verdict {
    pub fn new(decider: &'static str, decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decider,
            decision,
            reason: reason.into(),
        }
    }

    pub fn yes(decider: &'static str, reason: impl Into<String>) -> Self {
        Self::new(decider, Decision::Yes, reason)
    }

    pub fn throttle(decider: &'static str, reason: impl Into<String>) -> Self {
        Self::new(decider, Decision::Throttle, reason)
    }

    pub fn no(decider: &'static str, reason: impl Into<String>) -> Self {
        Self::new(decider, Decision::No, reason)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.decider, self.decision, self.reason)
    }
}

/// Combined answer of every decider for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDecision {
    pub node_id: String,
    pub decision: Decision,
    /// Every verdict when explaining, otherwise only the non-YES ones.
    pub verdicts: Vec<Verdict>,
}

impl NodeDecision {
    /// Reasons of the verdicts that match the combined decision.
    pub fn reasons(&self) -> String {
        self.verdicts
            .iter()
            .filter(|v| v.decision == self.decision)
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub trait AllocationDecider: Send + Sync {
    fn name(&self) -> &'static str;

    /// May `shard` be allocated to (or relocated onto) `node`?
    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        Verdict::yes(self.name(), "no constraint")
    }

    /// May `shard` stay on the node that currently holds it?
    fn can_remain(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Verdict {
        Verdict::yes(self.name(), "no constraint")
    }

    /// May this started copy be moved for balance?
    fn can_rebalance_shard(&self, _shard: &ShardRouting, _allocation: &RoutingAllocation<'_>) -> Verdict {
        Verdict::yes(self.name(), "no constraint")
    }

    /// May the rebalancer run at all right now?
    fn can_rebalance_cluster(&self, _allocation: &RoutingAllocation<'_>) -> Verdict {
        Verdict::yes(self.name(), "no constraint")
    }
}

/// The ordered set of active deciders.
pub struct AllocationDeciders {
    deciders: Vec<Box<dyn AllocationDecider>>,
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Box<dyn AllocationDecider>>) -> Self {
        Self { deciders }
    }

    /// The standard constraint set.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(SameShardDecider),
            Box::new(ReplicaAfterPrimaryActiveDecider),
            Box::new(DiskThresholdDecider),
            Box::new(ThrottlingDecider),
            Box::new(ConcurrentRecoveriesDecider),
            Box::new(EnableRebalanceDecider),
            Box::new(ClusterRebalanceDecider),
            Box::new(ConcurrentRebalanceDecider),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.deciders.iter().map(|d| d.name()).collect()
    }

    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        explain: bool,
    ) -> NodeDecision {
        let verdicts = self
            .deciders
            .iter()
            .map(|d| d.can_allocate(shard, node, allocation));
        combine(node.node_id(), verdicts, explain)
    }

    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
        explain: bool,
    ) -> NodeDecision {
        let verdicts = self
            .deciders
            .iter()
            .map(|d| d.can_remain(shard, node, allocation));
        combine(node.node_id(), verdicts, explain)
    }

    pub fn can_rebalance_shard(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decision {
        self.first_blocking(self.deciders.iter().map(|d| d.can_rebalance_shard(shard, allocation)))
    }

    pub fn can_rebalance_cluster(&self, allocation: &RoutingAllocation<'_>) -> Decision {
        self.first_blocking(self.deciders.iter().map(|d| d.can_rebalance_cluster(allocation)))
    }

    fn first_blocking(&self, verdicts: impl Iterator<Item = Verdict>) -> Decision {
        let mut decision = Decision::Yes;
        for verdict in verdicts {
            if verdict.decision != Decision::Yes {
                debug!(decider = verdict.decider, decision = %verdict.decision, reason = %verdict.reason, "rebalance blocked");
            }
            decision = decision.worst(verdict.decision);
            if decision == Decision::No {
                break;
            }
        }
        decision
    }
}

impl Default for AllocationDeciders {
    fn default() -> Self {
        Self::standard()
    }
}

/// Worst-of reduction. Stops at the first NO unless explaining.
fn combine(node_id: &str, verdicts: impl Iterator<Item = Verdict>, explain: bool) -> NodeDecision {
    let mut decision = Decision::Yes;
    let mut kept = Vec::new();
    for verdict in verdicts {
        decision = decision.worst(verdict.decision);
        if explain || verdict.decision != Decision::Yes {
            kept.push(verdict);
        }
        if decision == Decision::No && !explain {
            break;
        }
    }
    NodeDecision {
        node_id: node_id.to_string(),
        decision,
        verdicts: kept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_of() {
        assert_eq!(Decision::Yes.worst(Decision::Throttle), Decision::Throttle);
        assert_eq!(Decision::Throttle.worst(Decision::No), Decision::No);
        assert_eq!(Decision::No.worst(Decision::Yes), Decision::No);
    }

    #[test]
    fn test_combine_short_circuits_without_explain() {
        let verdicts = vec![
            Verdict::throttle("a", "busy"),
            Verdict::no("b", "full"),
            Verdict::no("c", "never reached"),
        ];
        let decision = combine("node1", verdicts.clone().into_iter(), false);
        assert_eq!(decision.decision, Decision::No);
        assert_eq!(decision.verdicts.len(), 2);
        assert_eq!(decision.reasons(), "[b] NO: full");

        let explained = combine("node1", verdicts.into_iter(), true);
        assert_eq!(explained.verdicts.len(), 3);
    }

    #[test]
    fn test_standard_set() {
        let names = AllocationDeciders::standard().names();
        assert_eq!(names.len(), 8);
        assert!(names.contains(&"same_shard"));
        assert!(names.contains(&"disk_threshold"));
    }
}
