//! Routing data model
//!
//! - `shard`: shard copies and their state machine
//! - `table`: the immutable, structurally shared routing table
//! - `state`: node membership, index metadata and `ClusterState`
//! - `nodes`: the mutable per-pass working view
//! - `changes`: transitions and the recovery requests they imply
//! - `health`: green/yellow/red summary of a snapshot

pub mod changes;
pub mod health;
pub mod nodes;
pub mod shard;
pub mod state;
pub mod table;

pub use changes::{RecoveryRequest, ShardTransition};
pub use health::{ClusterHealth, HealthStatus};
pub use nodes::{RoutingNode, RoutingNodes};
pub use shard::{ShardId, ShardRouting, ShardState, UnassignedInfo, UnassignedReason};
pub use state::{ClusterState, DiscoveryNode, DiscoveryNodes, DiskUsage, IndexMetadata, Metadata};
pub use table::{IndexRoutingTable, IndexShardRoutingTable, RoutingTable};
