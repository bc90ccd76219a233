//! # shardalloc
//!
//! Shard allocation engine for a distributed SQL database:
//! - Immutable, structurally shared routing table and cluster snapshots
//! - Pluggable allocation deciders (same shard, disk watermarks, recovery throttling, rebalance gating)
//! - Deterministic reroute passes with dead-node reconciliation and replica promotion
//! - Manual allocation commands (move, allocate, cancel)
//! - A single-writer coordinator that publishes snapshots in version order
//!
//! ## Architecture
//!
//! ```text
//! node / shard events, commands
//!             │
//!   ┌─────────▼──────────────┐
//!   │ AllocationCoordinator  │  one pass at a time, coalesced events
//!   └─────────┬──────────────┘
//!             │ reroute(state, trigger)
//!   ┌─────────▼──────────────┐      ┌──────────────────────┐
//!   │ AllocationService      │─────▶│ AllocationDeciders   │
//!   │  started / failed      │      │  YES / THROTTLE / NO │
//!   │  dead nodes            │      └──────────────────────┘
//!   │  commands              │
//!   │  allocate / move       │
//!   │  rebalance             │
//!   └─────────┬──────────────┘
//!             │ new ClusterState (watch) + recovery requests
//!             ▼
//!   readers, recovery subsystem
//! ```
//!
//! ## Usage
//!
//! ```bash
//! shardctl simulate \
//!   --nodes node1,node2,node3 \
//!   --index orders:3:1 \
//!   --kill node1 \
//!   --explain orders:0
//! ```

#![allow(clippy::result_large_err)]

pub mod allocation;
pub mod common;
pub mod coordinator;
pub mod routing;

// Re-export commonly used types
pub use allocation::{
    AllocationCommand, AllocationService, CommandOutcome, CommandRejection, Decision,
    RerouteResult, RerouteTrigger,
};
pub use common::{AllocationSettings, Config, Error, Result};
pub use coordinator::{AllocationCoordinator, CoordinatorHandle};
pub use routing::{
    ClusterHealth, ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata, RoutingTable,
    ShardId, ShardRouting, ShardState,
};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
