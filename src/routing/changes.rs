//! Transitions recorded during a reroute pass and the recoveries they imply

use crate::routing::shard::{ShardId, UnassignedReason};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One routing transition applied to the working view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardTransition {
    /// An unassigned (or missing) copy was placed on a node.
    Initialized {
        shard_id: ShardId,
        node: String,
        primary: bool,
        /// Node the copy recovers from; `None` for a fresh primary.
        source: Option<String>,
    },
    Started {
        shard_id: ShardId,
        node: String,
    },
    RelocationStarted {
        shard_id: ShardId,
        from: String,
        to: String,
        primary: bool,
    },
    RelocationCancelled {
        shard_id: ShardId,
        source: String,
        target: String,
    },
    Unassigned {
        shard_id: ShardId,
        node: String,
        reason: UnassignedReason,
    },
    /// A replica became primary in place.
    Promoted {
        shard_id: ShardId,
        node: String,
    },
    /// A copy on a departed node was forgotten without leaving a slot behind.
    Dropped {
        shard_id: ShardId,
        node: String,
    },
}

impl ShardTransition {
    pub fn shard_id(&self) -> &ShardId {
        match self {
            ShardTransition::Initialized { shard_id, .. }
            | ShardTransition::Started { shard_id, .. }
            | ShardTransition::RelocationStarted { shard_id, .. }
            | ShardTransition::RelocationCancelled { shard_id, .. }
            | ShardTransition::Unassigned { shard_id, .. }
            | ShardTransition::Promoted { shard_id, .. }
            | ShardTransition::Dropped { shard_id, .. } => shard_id,
        }
    }

    /// The recovery the transition asks the recovery subsystem to run, if any.
    pub fn recovery(&self) -> Option<RecoveryRequest> {
        match self {
            ShardTransition::Initialized {
                shard_id,
                node,
                primary,
                source,
            } => Some(RecoveryRequest {
                shard_id: shard_id.clone(),
                source_node: source.clone(),
                target_node: node.clone(),
                primary: *primary,
            }),
            ShardTransition::RelocationStarted {
                shard_id,
                from,
                to,
                primary,
            } => Some(RecoveryRequest {
                shard_id: shard_id.clone(),
                source_node: Some(from.clone()),
                target_node: to.clone(),
                primary: *primary,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ShardTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardTransition::Initialized {
                shard_id,
                node,
                primary,
                source,
            } => write!(
                f,
                "{} {} initializing on [{}] from [{}]",
                shard_id,
                if *primary { "primary" } else { "replica" },
                node,
                source.as_deref().unwrap_or("empty store")
            ),
            ShardTransition::Started { shard_id, node } => {
                write!(f, "{} started on [{}]", shard_id, node)
            }
            ShardTransition::RelocationStarted {
                shard_id, from, to, ..
            } => {
                write!(f, "{} relocating [{}] -> [{}]", shard_id, from, to)
            }
            ShardTransition::RelocationCancelled {
                shard_id,
                source,
                target,
            } => write!(
                f,
                "{} relocation [{}] -> [{}] cancelled",
                shard_id, source, target
            ),
            ShardTransition::Unassigned {
                shard_id,
                node,
                reason,
            } => write!(f, "{} on [{}] unassigned ({})", shard_id, node, reason),
            ShardTransition::Promoted { shard_id, node } => {
                write!(f, "{} replica on [{}] promoted to primary", shard_id, node)
            }
            ShardTransition::Dropped { shard_id, node } => {
                write!(f, "{} copy on departed [{}] dropped", shard_id, node)
            }
        }
    }
}

/// Outbound request for the recovery subsystem. It answers later with a
/// shard-started or shard-failed report for `(shard_id, target_node)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub shard_id: ShardId,
    pub source_node: Option<String>,
    pub target_node: String,
    pub primary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_requests() {
        let shard_id = ShardId::new("test", 0);
        let init = ShardTransition::Initialized {
            shard_id: shard_id.clone(),
            node: "node1".into(),
            primary: true,
            source: None,
        };
        let recovery = init.recovery().unwrap();
        assert_eq!(recovery.target_node, "node1");
        assert!(recovery.source_node.is_none());

        let relocation = ShardTransition::RelocationStarted {
            shard_id: shard_id.clone(),
            from: "node1".into(),
            to: "node3".into(),
            primary: true,
        };
        assert_eq!(
            relocation.recovery().unwrap().source_node.as_deref(),
            Some("node1")
        );

        let started = ShardTransition::Started {
            shard_id,
            node: "node1".into(),
        };
        assert!(started.recovery().is_none());
    }
}
