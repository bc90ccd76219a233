//! Allocation diagnostics
//!
//! Failed allocation attempts are kept per shard in the cluster state so an
//! operator can see why a copy is stuck, even after it was later placed.

use crate::allocation::decider::{Decision, NodeDecision};
use crate::routing::{ShardId, ShardRouting};
use serde::Serialize;
use std::collections::BTreeMap;

/// Attempts kept per shard; older ones are discarded first.
const MAX_ATTEMPTS_PER_SHARD: usize = 16;

/// One unsuccessful attempt to place a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationAttempt {
    pub primary: bool,
    /// `Throttle` when placement was deferred, `No` when every node refused.
    pub outcome: Decision,
    pub nodes: Vec<NodeDecision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationHistory {
    shards: BTreeMap<ShardId, Vec<AllocationAttempt>>,
}

impl AllocationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt unless it repeats the latest one for the same kind
    /// of copy. Returns whether anything was recorded.
    pub fn record(&mut self, shard_id: &ShardId, attempt: AllocationAttempt) -> bool {
        let attempts = self.shards.entry(shard_id.clone()).or_default();
        let latest = attempts.iter().rev().find(|a| a.primary == attempt.primary);
        if latest == Some(&attempt) {
            return false;
        }
        attempts.push(attempt);
        if attempts.len() > MAX_ATTEMPTS_PER_SHARD {
            attempts.remove(0);
        }
        true
    }

    pub fn attempts(&self, shard_id: &ShardId) -> &[AllocationAttempt] {
        self.shards.get(shard_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardId> {
        self.shards.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn without_index(&self, index: &str) -> Self {
        Self {
            shards: self
                .shards
                .iter()
                .filter(|(id, _)| id.index != index)
                .map(|(id, attempts)| (id.clone(), attempts.clone()))
                .collect(),
        }
    }
}

/// Answer to "why is this copy where it is (or nowhere)?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationExplanation {
    pub shard_id: ShardId,
    /// The copy explained: the first unassigned copy, else the primary.
    pub copy: ShardRouting,
    /// Combined decision over all candidate nodes.
    pub decision: Decision,
    /// Whether the copy may stay on its current node, for assigned copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remain: Option<NodeDecision>,
    /// Every live node in allocation order, with every decider's verdict.
    pub nodes: Vec<NodeDecision>,
    pub history: Vec<AllocationAttempt>,
}

impl AllocationExplanation {
    /// Best decision across `nodes`: YES if any node accepts.
    pub(crate) fn best_of(nodes: &[NodeDecision]) -> Decision {
        nodes
            .iter()
            .map(|n| n.decision)
            .min()
            .unwrap_or(Decision::No)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(primary: bool, outcome: Decision) -> AllocationAttempt {
        AllocationAttempt {
            primary,
            outcome,
            nodes: vec![NodeDecision {
                node_id: "node1".into(),
                decision: outcome,
                verdicts: vec![],
            }],
        }
    }

    #[test]
    fn test_consecutive_attempts_are_collapsed() {
        let shard_id = ShardId::new("test", 0);
        let mut history = AllocationHistory::new();
        assert!(history.record(&shard_id, attempt(false, Decision::No)));
        assert!(!history.record(&shard_id, attempt(false, Decision::No)));
        assert!(history.record(&shard_id, attempt(true, Decision::Throttle)));
        assert!(!history.record(&shard_id, attempt(false, Decision::No)));
        assert!(history.record(&shard_id, attempt(false, Decision::Throttle)));
        assert_eq!(history.attempts(&shard_id).len(), 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let shard_id = ShardId::new("test", 0);
        let mut history = AllocationHistory::new();
        for i in 0..40 {
            let outcome = if i % 2 == 0 { Decision::No } else { Decision::Throttle };
            history.record(&shard_id, attempt(false, outcome));
        }
        assert_eq!(history.attempts(&shard_id).len(), MAX_ATTEMPTS_PER_SHARD);
    }

    #[test]
    fn test_without_index() {
        let mut history = AllocationHistory::new();
        history.record(&ShardId::new("a", 0), attempt(true, Decision::No));
        history.record(&ShardId::new("b", 0), attempt(true, Decision::No));
        let pruned = history.without_index("a");
        assert!(pruned.attempts(&ShardId::new("a", 0)).is_empty());
        assert_eq!(pruned.shards().count(), 1);
    }
}
