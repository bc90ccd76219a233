//! Cluster health derived from a snapshot

use crate::routing::state::ClusterState;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every primary and replica is active.
    Green,
    /// Every primary is active, some replicas are not.
    Yellow,
    /// At least one primary is not active.
    Red,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Green => write!(f, "green"),
            HealthStatus::Yellow => write!(f, "yellow"),
            HealthStatus::Red => write!(f, "red"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: HealthStatus,
    pub version: u64,
    pub nodes: usize,
    pub active_primaries: usize,
    pub active: usize,
    pub initializing: usize,
    pub relocating: usize,
    pub unassigned: usize,
    /// Replica slots the metadata asks for but the table does not hold,
    /// e.g. after a promotion with nowhere to rebuild the replica.
    pub missing: usize,
}

impl ClusterHealth {
    pub fn of(state: &ClusterState) -> Self {
        let mut health = ClusterHealth {
            status: HealthStatus::Green,
            version: state.version(),
            nodes: state.nodes().len(),
            active_primaries: 0,
            active: 0,
            initializing: 0,
            relocating: 0,
            unassigned: 0,
            missing: 0,
        };

        for meta in state.metadata().indices() {
            let Some(index) = state.routing_table().index(&meta.name) else {
                continue;
            };
            for shard in index.shards() {
                for copy in shard.copies() {
                    if copy.active() {
                        health.active += 1;
                    }
                    if copy.relocating() {
                        // the derived target is initializing too
                        health.relocating += 1;
                        health.initializing += 1;
                    }
                    if copy.initializing() {
                        health.initializing += 1;
                    }
                    if copy.unassigned() {
                        health.unassigned += 1;
                    }
                }
                health.missing += meta
                    .copies_per_shard()
                    .saturating_sub(shard.copies().len());

                let status = match shard.primary() {
                    Some(p) if p.active() => {
                        health.active_primaries += 1;
                        if shard.active_count() < meta.copies_per_shard() {
                            HealthStatus::Yellow
                        } else {
                            HealthStatus::Green
                        }
                    }
                    _ => HealthStatus::Red,
                };
                health.status = health.status.max(status);
            }
        }
        health
    }
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={} version={} nodes={} active_primaries={} active={} initializing={} relocating={} unassigned={} missing={}",
            self.status,
            self.version,
            self.nodes,
            self.active_primaries,
            self.active,
            self.initializing,
            self.relocating,
            self.unassigned,
            self.missing
        )
    }
}
