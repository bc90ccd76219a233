//! Reroute: one deterministic pass from a snapshot and a trigger to the
//! next snapshot.

use crate::allocation::command::{self, AllocationCommand, CommandOutcome};
use crate::allocation::decider::{AllocationDeciders, Decision};
use crate::allocation::explain::AllocationExplanation;
use crate::allocation::{allocator, dead_nodes, RoutingAllocation};
use crate::common::{AllocationSettings, Error, Result};
use crate::routing::{
    ClusterState, RecoveryRequest, ShardId, ShardRouting, ShardTransition, UnassignedInfo,
    UnassignedReason,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A recovery that completed on `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedShard {
    pub shard_id: ShardId,
    pub node_id: String,
}

/// A copy that failed on `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedShard {
    pub shard_id: ShardId,
    pub node_id: String,
    pub reason: String,
}

/// Everything one reroute pass should apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerouteTrigger {
    pub reason: String,
    /// Stamped on every unassigned copy the pass produces.
    pub at: DateTime<Utc>,
    pub started: Vec<StartedShard>,
    pub failed: Vec<FailedShard>,
    pub commands: Vec<AllocationCommand>,
}

impl RerouteTrigger {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            at: Utc::now(),
            started: Vec::new(),
            failed: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn with_started(mut self, shard_id: ShardId, node_id: impl Into<String>) -> Self {
        self.started.push(StartedShard {
            shard_id,
            node_id: node_id.into(),
        });
        self
    }

    pub fn with_failed(
        mut self,
        shard_id: ShardId,
        node_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        self.failed.push(FailedShard {
            shard_id,
            node_id: node_id.into(),
            reason: reason.into(),
        });
        self
    }

    pub fn with_command(mut self, command: AllocationCommand) -> Self {
        self.commands.push(command);
        self
    }

    /// Fold a later trigger into this one, keeping event order.
    pub fn merge(&mut self, other: RerouteTrigger) {
        if self.reason != other.reason {
            self.reason = format!("{}, {}", self.reason, other.reason);
        }
        self.at = self.at.max(other.at);
        self.started.extend(other.started);
        self.failed.extend(other.failed);
        self.commands.extend(other.commands);
    }
}

#[derive(Debug, Clone)]
pub struct RerouteResult {
    /// The new snapshot, or the input itself when nothing changed.
    pub state: ClusterState,
    pub changed: bool,
    pub transitions: Vec<ShardTransition>,
    /// Recoveries to start, one per copy left initializing by this pass.
    pub recoveries: Vec<RecoveryRequest>,
    pub command_outcomes: Vec<CommandOutcome>,
}

pub struct AllocationService {
    settings: AllocationSettings,
    deciders: AllocationDeciders,
}

impl AllocationService {
    pub fn new(settings: AllocationSettings) -> Self {
        Self::with_deciders(settings, AllocationDeciders::standard())
    }

    pub fn with_deciders(settings: AllocationSettings, deciders: AllocationDeciders) -> Self {
        Self { settings, deciders }
    }

    pub fn settings(&self) -> &AllocationSettings {
        &self.settings
    }

    /// Run one pass. Settings that fail validation refuse the pass with
    /// `InvalidConfig`. Any other `Err` is fatal: the routing state could
    /// not be kept consistent and nothing must be published.
    pub fn reroute(&self, state: &ClusterState, trigger: RerouteTrigger) -> Result<RerouteResult> {
        self.settings.validate()?;
        debug!(
            reason = %trigger.reason,
            version = state.version(),
            started = trigger.started.len(),
            failed = trigger.failed.len(),
            commands = trigger.commands.len(),
            "Reroute"
        );
        let mut allocation = RoutingAllocation::new(state, &self.settings, trigger.at)?;

        for started in &trigger.started {
            apply_started(&mut allocation, started)?;
        }
        for failed in &trigger.failed {
            apply_failed(&mut allocation, failed)?;
        }
        dead_nodes::reconcile(&mut allocation)?;
        let command_outcomes = command::execute_all(&mut allocation, &self.deciders, &trigger.commands)?;

        allocator::allocate_unassigned(&mut allocation, &self.deciders)?;
        allocator::replenish_replicas(&mut allocation, &self.deciders)?;
        allocator::move_shards(&mut allocation, &self.deciders)?;
        allocator::rebalance(&mut allocation, &self.deciders)?;

        let (mut routing_nodes, history) = allocation.into_parts();
        routing_nodes.validate(state.metadata())?;
        let routing_table = routing_nodes.freeze(state.routing_table(), state.metadata());
        let transitions = routing_nodes.take_transitions();

        let changed = routing_table != *state.routing_table() || history != *state.history();
        if !changed {
            return Ok(RerouteResult {
                state: state.clone(),
                changed,
                transitions,
                recoveries: Vec::new(),
                command_outcomes,
            });
        }

        let recoveries: Vec<RecoveryRequest> = transitions
            .iter()
            .filter_map(ShardTransition::recovery)
            .filter(|r| {
                routing_nodes
                    .copy_on(&r.shard_id, &r.target_node)
                    .is_some_and(ShardRouting::initializing)
            })
            .collect();
        for transition in &transitions {
            debug!(%transition, "Routing transition");
        }

        let next = state.next(routing_table, history);
        info!(
            reason = %trigger.reason,
            version = next.version(),
            transitions = transitions.len(),
            recoveries = recoveries.len(),
            "Reroute changed routing"
        );
        Ok(RerouteResult {
            state: next,
            changed,
            transitions,
            recoveries,
            command_outcomes,
        })
    }

    /// Explain where a shard can go, without changing anything.
    pub fn explain(&self, state: &ClusterState, shard_id: &ShardId) -> Result<AllocationExplanation> {
        let known = state
            .metadata()
            .index(&shard_id.index)
            .is_some_and(|m| shard_id.id < m.number_of_shards);
        if !known {
            return Err(Error::ShardNotFound(shard_id.to_string()));
        }

        let allocation = RoutingAllocation::new(state, &self.settings, Utc::now())?;
        let routing_nodes = allocation.routing_nodes();
        let copy = routing_nodes
            .unassigned()
            .iter()
            .filter(|u| u.shard_id() == shard_id)
            .min_by_key(|u| !u.primary())
            .or_else(|| routing_nodes.primary(shard_id))
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(shard_id.to_string()))?;

        let remain = copy
            .current_node_id()
            .and_then(|n| routing_nodes.node(n))
            .map(|node| self.deciders.can_remain(&copy, node, &allocation, true));
        let nodes: Vec<_> = allocator::candidate_nodes(&allocation)
            .iter()
            .filter_map(|id| routing_nodes.node(id))
            .map(|node| self.deciders.can_allocate(&copy, node, &allocation, true))
            .collect();
        let decision = if nodes.is_empty() {
            Decision::No
        } else {
            AllocationExplanation::best_of(&nodes)
        };

        Ok(AllocationExplanation {
            shard_id: shard_id.clone(),
            history: allocation.history().attempts(shard_id).to_vec(),
            copy,
            decision,
            remain,
            nodes,
        })
    }
}

fn apply_started(allocation: &mut RoutingAllocation<'_>, started: &StartedShard) -> Result<()> {
    let is_initializing = allocation
        .routing_nodes()
        .copy_on(&started.shard_id, &started.node_id)
        .is_some_and(ShardRouting::initializing);
    if !is_initializing {
        debug!(shard = %started.shard_id, node = %started.node_id, "Ignoring stale shard-started report");
        return Ok(());
    }
    allocation
        .routing_nodes_mut()
        .start(&started.shard_id, &started.node_id)
}

/// A failed relocation target cancels the move. Any other failed copy is
/// unassigned; a failed primary first takes its recovering replicas down
/// and then hands over to an active replica if there is one.
fn apply_failed(allocation: &mut RoutingAllocation<'_>, failed: &FailedShard) -> Result<()> {
    let Some(copy) = allocation
        .routing_nodes()
        .copy_on(&failed.shard_id, &failed.node_id)
        .cloned()
    else {
        debug!(shard = %failed.shard_id, node = %failed.node_id, "Ignoring stale shard-failed report");
        return Ok(());
    };
    info!(shard = %failed.shard_id, node = %failed.node_id, reason = %failed.reason, "Shard failed");

    let shard_id = &failed.shard_id;
    if copy.is_relocation_target() {
        let source = copy.relocating_node_id().unwrap_or_default().to_string();
        return allocation
            .routing_nodes_mut()
            .cancel_relocation(shard_id, &source);
    }

    if copy.primary() {
        dead_nodes::fail_initializing_replicas(
            allocation,
            shard_id,
            &format!("primary failed: {}", failed.reason),
        )?;
    }
    let info = UnassignedInfo::new(UnassignedReason::AllocationFailed, allocation.at())
        .with_message(failed.reason.clone());
    let routing_nodes = allocation.routing_nodes_mut();
    routing_nodes.move_to_unassigned(shard_id, &failed.node_id, info)?;
    if copy.primary() {
        if let Some(promoted) = routing_nodes.promote_active_replica(shard_id)? {
            info!(shard = %shard_id, node = %promoted, "Replica promoted after primary failure");
        }
    }
    Ok(())
}
