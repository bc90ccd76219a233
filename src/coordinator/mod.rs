//! Single-writer allocation coordinator
//!
//! The coordinator owns the current `ClusterState` and is the only task
//! that runs reroute passes:
//! - inbound events arrive on one queue and are applied in order
//! - events queued while a pass runs are coalesced into the next pass
//! - every new snapshot is published on a `watch` channel, so readers
//!   observe strictly increasing versions
//! - recovery requests go out after the snapshot that asks for them

pub mod handle;
pub mod server;

pub use handle::CoordinatorHandle;
pub use server::AllocationCoordinator;
