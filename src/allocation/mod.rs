//! Allocation engine
//!
//! One reroute pass, in order:
//! 1. apply started and failed shard reports
//! 2. reconcile copies held by departed nodes
//! 3. apply manual allocation commands
//! 4. allocate unassigned copies and replenish missing replicas
//! 5. move copies that may not remain where they are
//! 6. rebalance
//!
//! Every step mutates the same [`RoutingAllocation`], which is frozen into
//! a new `ClusterState` at the end.

pub mod allocator;
pub mod command;
pub mod dead_nodes;
pub mod decider;
pub mod explain;
pub mod service;

pub use command::{AllocationCommand, CommandOutcome, CommandRejection};
pub use decider::{AllocationDecider, AllocationDeciders, Decision, NodeDecision, Verdict};
pub use explain::{AllocationAttempt, AllocationExplanation, AllocationHistory};
pub use service::{
    AllocationService, FailedShard, RerouteResult, RerouteTrigger, StartedShard,
};

use crate::common::{AllocationSettings, Result};
use crate::routing::{ClusterState, DiskUsage, RoutingNodes};
use chrono::{DateTime, Utc};

/// Mutable context of one reroute pass.
pub struct RoutingAllocation<'a> {
    routing_nodes: RoutingNodes,
    state: &'a ClusterState,
    settings: &'a AllocationSettings,
    history: AllocationHistory,
    at: DateTime<Utc>,
}

impl<'a> RoutingAllocation<'a> {
    pub fn new(
        state: &'a ClusterState,
        settings: &'a AllocationSettings,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            routing_nodes: RoutingNodes::new(state)?,
            state,
            settings,
            history: state.history().clone(),
            at,
        })
    }

    pub fn routing_nodes(&self) -> &RoutingNodes {
        &self.routing_nodes
    }

    pub fn routing_nodes_mut(&mut self) -> &mut RoutingNodes {
        &mut self.routing_nodes
    }

    /// The snapshot this pass started from.
    pub fn state(&self) -> &'a ClusterState {
        self.state
    }

    pub fn settings(&self) -> &'a AllocationSettings {
        self.settings
    }

    pub fn history(&self) -> &AllocationHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut AllocationHistory {
        &mut self.history
    }

    /// Timestamp stamped on every change made by this pass.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn disk_usage(&self, node_id: &str) -> Option<DiskUsage> {
        self.state.nodes().get(node_id).and_then(|n| n.disk)
    }

    pub(crate) fn into_parts(self) -> (RoutingNodes, AllocationHistory) {
        (self.routing_nodes, self.history)
    }
}
