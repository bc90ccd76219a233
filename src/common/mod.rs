//! Common utilities and types shared across shardalloc

pub mod config;
pub mod error;
pub mod utils;

pub use config::{
    AllocationSettings, AllowRebalance, Config, DiskThresholdSettings, RebalanceMode,
    RebalanceSettings, Watermark,
};
pub use error::{Error, Result};
pub use utils::{format_bytes, parse_bytes};
