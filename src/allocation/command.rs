//! Manual allocation commands
//!
//! A command is validated in full against the current working view before
//! anything is mutated, so a rejected command leaves the view untouched.
//! Rejections are expected user input and never fatal.

use crate::allocation::decider::{AllocationDeciders, Decision};
use crate::allocation::RoutingAllocation;
use crate::common::Result;
use crate::routing::{RoutingNodes, ShardId, ShardRouting, ShardState, UnassignedInfo, UnassignedReason};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationCommand {
    /// Relocate a started copy.
    Move {
        shard_id: ShardId,
        from_node: String,
        to_node: String,
    },
    /// Place an unassigned copy. Taking the primary slot requires
    /// `allow_primary`, since an empty primary replaces any lost data.
    Allocate {
        shard_id: ShardId,
        node: String,
        #[serde(default)]
        allow_primary: bool,
    },
    /// Abort an in-flight recovery or relocation on `node`.
    Cancel {
        shard_id: ShardId,
        node: String,
        #[serde(default)]
        allow_primary: bool,
    },
}

impl AllocationCommand {
    pub fn shard_id(&self) -> &ShardId {
        match self {
            AllocationCommand::Move { shard_id, .. }
            | AllocationCommand::Allocate { shard_id, .. }
            | AllocationCommand::Cancel { shard_id, .. } => shard_id,
        }
    }
}

impl fmt::Display for AllocationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationCommand::Move {
                shard_id,
                from_node,
                to_node,
            } => write!(f, "move {} [{}] -> [{}]", shard_id, from_node, to_node),
            AllocationCommand::Allocate { shard_id, node, .. } => {
                write!(f, "allocate {} on [{}]", shard_id, node)
            }
            AllocationCommand::Cancel { shard_id, node, .. } => {
                write!(f, "cancel {} on [{}]", shard_id, node)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum CommandRejection {
    #[error("shard {0} does not exist")]
    UnknownShard(ShardId),

    #[error("node [{0}] is not part of the cluster")]
    UnknownNode(String),

    #[error("node [{0}] left the cluster")]
    NodeNotLive(String),

    #[error("node [{node}] already holds a copy of {shard_id}")]
    AlreadyAllocated { shard_id: ShardId, node: String },

    #[error("node [{node}] holds no copy of {shard_id}")]
    NotOnNode { shard_id: ShardId, node: String },

    #[error("cannot {action} {shard_id} on [{node}] in state {state}")]
    InvalidState {
        shard_id: ShardId,
        node: String,
        state: ShardState,
        action: String,
    },

    #[error("{0} has no unassigned copy")]
    NoUnassignedCopy(ShardId),

    #[error("{0} is a primary, set allow_primary to accept the consequences")]
    PrimaryNotAllowed(ShardId),

    #[error("{shard_id} vetoed on [{node}]: {reasons}")]
    Vetoed {
        shard_id: ShardId,
        node: String,
        reasons: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub command: AllocationCommand,
    pub result: std::result::Result<(), CommandRejection>,
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        self.result.is_ok()
    }
}

/// Mutation a command resolved to after validation.
enum Plan {
    Relocate { from: String, to: String },
    Initialize { copy: ShardRouting, node: String },
    CancelRelocation { source: String },
    Unassign { node: String },
}

/// Execute commands in order, each against the view left by the previous.
pub fn execute_all(
    allocation: &mut RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    commands: &[AllocationCommand],
) -> Result<Vec<CommandOutcome>> {
    commands
        .iter()
        .map(|command| execute(allocation, deciders, command))
        .collect()
}

/// Execute one command. `Err` means the working view is broken; a bad
/// command comes back as `Ok` with a rejection.
pub fn execute(
    allocation: &mut RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    command: &AllocationCommand,
) -> Result<CommandOutcome> {
    let plan = match validate(allocation, deciders, command) {
        Ok(plan) => plan,
        Err(rejection) => {
            warn!(command = %command, reason = %rejection, "Allocation command rejected");
            return Ok(CommandOutcome {
                command: command.clone(),
                result: Err(rejection),
            });
        }
    };

    let shard_id = command.shard_id();
    let at = allocation.at();
    let routing_nodes = allocation.routing_nodes_mut();
    match plan {
        Plan::Relocate { from, to } => routing_nodes.relocate(shard_id, &from, &to)?,
        Plan::Initialize { copy, node } => routing_nodes.initialize(&copy, &node)?,
        Plan::CancelRelocation { source } => routing_nodes.cancel_relocation(shard_id, &source)?,
        Plan::Unassign { node } => {
            let info = UnassignedInfo::new(UnassignedReason::RerouteCancelled, at)
                .with_message("cancelled by allocation command");
            routing_nodes.move_to_unassigned(shard_id, &node, info)?
        }
    }
    info!(command = %command, "Allocation command applied");
    Ok(CommandOutcome {
        command: command.clone(),
        result: Ok(()),
    })
}

fn validate(
    allocation: &RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    command: &AllocationCommand,
) -> std::result::Result<Plan, CommandRejection> {
    let routing_nodes = allocation.routing_nodes();
    let shard_id = command.shard_id();
    let exists = allocation
        .state()
        .metadata()
        .index(&shard_id.index)
        .is_some_and(|m| shard_id.id < m.number_of_shards);
    if !exists {
        return Err(CommandRejection::UnknownShard(shard_id.clone()));
    }

    match command {
        AllocationCommand::Move {
            from_node, to_node, ..
        } => {
            check_live(routing_nodes, to_node)?;
            let copy = copy_on(routing_nodes, shard_id, from_node)?;
            if !copy.started() {
                return Err(invalid_state(copy, from_node, "move"));
            }
            check_target(allocation, deciders, copy, to_node)?;
            Ok(Plan::Relocate {
                from: from_node.clone(),
                to: to_node.clone(),
            })
        }
        AllocationCommand::Allocate {
            node,
            allow_primary,
            ..
        } => {
            check_live(routing_nodes, node)?;
            let unassigned: Vec<&ShardRouting> = routing_nodes
                .unassigned()
                .iter()
                .filter(|u| u.shard_id() == shard_id)
                .collect();
            let primary = unassigned.iter().find(|u| u.primary());
            let replica = unassigned.iter().find(|u| !u.primary());
            let copy = match (primary, replica) {
                (Some(primary), _) if *allow_primary => *primary,
                (_, Some(replica)) => *replica,
                (Some(_), None) => return Err(CommandRejection::PrimaryNotAllowed(shard_id.clone())),
                (None, None) => return Err(CommandRejection::NoUnassignedCopy(shard_id.clone())),
            };
            check_target(allocation, deciders, copy, node)?;
            Ok(Plan::Initialize {
                copy: copy.clone(),
                node: node.clone(),
            })
        }
        AllocationCommand::Cancel {
            node,
            allow_primary,
            ..
        } => {
            check_live(routing_nodes, node)?;
            let copy = copy_on(routing_nodes, shard_id, node)?;
            if copy.is_relocation_target() {
                Ok(Plan::CancelRelocation {
                    source: copy.relocating_node_id().unwrap_or_default().to_string(),
                })
            } else if copy.relocating() {
                Ok(Plan::CancelRelocation {
                    source: node.clone(),
                })
            } else if copy.initializing() {
                if copy.primary() && !allow_primary {
                    return Err(CommandRejection::PrimaryNotAllowed(shard_id.clone()));
                }
                Ok(Plan::Unassign { node: node.clone() })
            } else {
                Err(invalid_state(copy, node, "cancel"))
            }
        }
    }
}

fn check_live(routing_nodes: &RoutingNodes, node_id: &str) -> std::result::Result<(), CommandRejection> {
    if routing_nodes.is_live(node_id) {
        Ok(())
    } else if routing_nodes.has_departed(node_id) {
        Err(CommandRejection::NodeNotLive(node_id.to_string()))
    } else {
        Err(CommandRejection::UnknownNode(node_id.to_string()))
    }
}

fn copy_on<'r>(
    routing_nodes: &'r RoutingNodes,
    shard_id: &ShardId,
    node_id: &str,
) -> std::result::Result<&'r ShardRouting, CommandRejection> {
    routing_nodes
        .copy_on(shard_id, node_id)
        .ok_or_else(|| CommandRejection::NotOnNode {
            shard_id: shard_id.clone(),
            node: node_id.to_string(),
        })
}

/// The target must not hold the shard already and no decider may say NO.
/// THROTTLE is accepted: an operator asked for this explicitly.
fn check_target(
    allocation: &RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    copy: &ShardRouting,
    node_id: &str,
) -> std::result::Result<(), CommandRejection> {
    let routing_nodes = allocation.routing_nodes();
    if routing_nodes.copy_on(copy.shard_id(), node_id).is_some() {
        return Err(CommandRejection::AlreadyAllocated {
            shard_id: copy.shard_id().clone(),
            node: node_id.to_string(),
        });
    }
    let node = routing_nodes
        .node(node_id)
        .ok_or_else(|| CommandRejection::UnknownNode(node_id.to_string()))?;
    let decision = deciders.can_allocate(copy, node, allocation, false);
    if decision.decision == Decision::No {
        return Err(CommandRejection::Vetoed {
            shard_id: copy.shard_id().clone(),
            node: node_id.to_string(),
            reasons: decision.reasons(),
        });
    }
    Ok(())
}

fn invalid_state(copy: &ShardRouting, node_id: &str, action: &str) -> CommandRejection {
    CommandRejection::InvalidState {
        shard_id: copy.shard_id().clone(),
        node: node_id.to_string(),
        state: copy.state(),
        action: action.to_string(),
    }
}
