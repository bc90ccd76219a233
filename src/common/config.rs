//! Configuration for the allocation engine
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `SHARDALLOC_*` environment variables (`__` separates nesting,
//! e.g. `SHARDALLOC_ALLOCATION__REBALANCE__ENABLE=none`).

use crate::common::utils::{format_bytes, parse_bytes};
use crate::routing::DiskUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Allocation settings
    #[serde(default)]
    pub allocation: AllocationSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            allocation: AllocationSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("SHARDALLOC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.allocation.validate()?;
        Ok(cfg)
    }
}

/// Options recognized by the allocation deciders and the allocator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSettings {
    /// Max shards initializing on, or relocating away from, a single node
    #[serde(default = "default_node_concurrent_recoveries")]
    pub node_concurrent_recoveries: usize,

    /// Max fresh primaries (no recovery source) initializing on a single node
    #[serde(default = "default_node_initial_primaries_recoveries")]
    pub node_initial_primaries_recoveries: usize,

    /// Max initializing shard copies across the whole cluster
    #[serde(default = "default_cluster_concurrent_recoveries")]
    pub cluster_concurrent_recoveries: usize,

    /// Max relocations in flight before the rebalancer stops starting new ones
    #[serde(default = "default_cluster_concurrent_rebalance")]
    pub cluster_concurrent_rebalance: usize,

    #[serde(default)]
    pub disk: DiskThresholdSettings,

    #[serde(default)]
    pub rebalance: RebalanceSettings,
}

fn default_node_concurrent_recoveries() -> usize {
    2
}
fn default_node_initial_primaries_recoveries() -> usize {
    4
}
fn default_cluster_concurrent_recoveries() -> usize {
    16
}
fn default_cluster_concurrent_rebalance() -> usize {
    2
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            node_concurrent_recoveries: default_node_concurrent_recoveries(),
            node_initial_primaries_recoveries: default_node_initial_primaries_recoveries(),
            cluster_concurrent_recoveries: default_cluster_concurrent_recoveries(),
            cluster_concurrent_rebalance: default_cluster_concurrent_rebalance(),
            disk: DiskThresholdSettings::default(),
            rebalance: RebalanceSettings::default(),
        }
    }
}

impl AllocationSettings {
    pub fn validate(&self) -> crate::Result<()> {
        let limits = [
            ("node_concurrent_recoveries", self.node_concurrent_recoveries),
            (
                "node_initial_primaries_recoveries",
                self.node_initial_primaries_recoveries,
            ),
            (
                "cluster_concurrent_recoveries",
                self.cluster_concurrent_recoveries,
            ),
            (
                "cluster_concurrent_rebalance",
                self.cluster_concurrent_rebalance,
            ),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(crate::Error::InvalidConfig(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        if !(self.rebalance.threshold.is_finite() && self.rebalance.threshold >= 0.0) {
            return Err(crate::Error::InvalidConfig(format!(
                "rebalance.threshold must be a non-negative number, got {}",
                self.rebalance.threshold
            )));
        }

        self.disk.validate()
    }
}

/// Disk usage thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskThresholdSettings {
    #[serde(default = "default_disk_enabled")]
    pub enabled: bool,

    /// Above this, nodes only receive shards later (THROTTLE)
    #[serde(default = "default_low_watermark")]
    pub low_watermark: Watermark,

    /// Above this, nodes receive nothing and must shed shards (NO)
    #[serde(default = "default_high_watermark")]
    pub high_watermark: Watermark,
}

fn default_disk_enabled() -> bool {
    true
}
fn default_low_watermark() -> Watermark {
    Watermark::UsedPercent(85.0)
}
fn default_high_watermark() -> Watermark {
    Watermark::UsedPercent(90.0)
}

impl Default for DiskThresholdSettings {
    fn default() -> Self {
        Self {
            enabled: default_disk_enabled(),
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
        }
    }
}

impl DiskThresholdSettings {
    fn validate(&self) -> crate::Result<()> {
        for mark in [self.low_watermark, self.high_watermark] {
            if let Watermark::UsedPercent(p) = mark {
                if !(0.0..=100.0).contains(&p) {
                    return Err(crate::Error::InvalidConfig(format!(
                        "watermark {} is outside 0%..100%",
                        mark
                    )));
                }
            }
        }

        let inverted = match (self.low_watermark, self.high_watermark) {
            (Watermark::UsedPercent(low), Watermark::UsedPercent(high)) => low > high,
            (Watermark::FreeBytes(low), Watermark::FreeBytes(high)) => low < high,
            _ => false,
        };
        if inverted {
            return Err(crate::Error::InvalidConfig(format!(
                "low watermark {} must not be stricter than high watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

/// A disk watermark: either a used-space percentage or a free-space floor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Watermark {
    UsedPercent(f64),
    FreeBytes(u64),
}

impl Watermark {
    /// Whether the node's usage is past this watermark.
    pub fn is_exceeded_by(&self, usage: &DiskUsage) -> bool {
        match *self {
            Watermark::UsedPercent(p) => usage.used_percent() > p,
            Watermark::FreeBytes(min_free) => usage.free_bytes < min_free,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::UsedPercent(p) => write!(f, "{}%", p),
            Watermark::FreeBytes(b) => write!(f, "{} free", format_bytes(*b)),
        }
    }
}

impl TryFrom<String> for Watermark {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        let value = value.trim();
        match value.strip_suffix('%') {
            Some(pct) => pct.trim().parse::<f64>().map(Watermark::UsedPercent).map_err(|_| {
                crate::Error::InvalidConfig(format!("invalid watermark: {}", value))
            }),
            None => parse_bytes(value).map(Watermark::FreeBytes),
        }
    }
}

impl From<Watermark> for String {
    fn from(mark: Watermark) -> Self {
        match mark {
            Watermark::UsedPercent(p) => format!("{}%", p),
            Watermark::FreeBytes(b) => format!("{}b", b),
        }
    }
}

/// Rebalancing behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceSettings {
    #[serde(default)]
    pub enable: RebalanceMode,

    #[serde(default)]
    pub allow: AllowRebalance,

    /// Minimum spread in shard count between the most and the least loaded node
    #[serde(default = "default_rebalance_threshold")]
    pub threshold: f32,
}

fn default_rebalance_threshold() -> f32 {
    1.0
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            enable: RebalanceMode::default(),
            allow: AllowRebalance::default(),
            threshold: default_rebalance_threshold(),
        }
    }
}

/// Which shard copies the rebalancer may move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceMode {
    #[default]
    All,
    None,
    Primaries,
    Replicas,
}

impl fmt::Display for RebalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceMode::All => write!(f, "all"),
            RebalanceMode::None => write!(f, "none"),
            RebalanceMode::Primaries => write!(f, "primaries"),
            RebalanceMode::Replicas => write!(f, "replicas"),
        }
    }
}

/// When the rebalancer may run at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowRebalance {
    Always,
    IndicesPrimariesActive,
    #[default]
    IndicesAllActive,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = AllocationSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.rebalance.enable, RebalanceMode::All);
        assert_eq!(settings.rebalance.allow, AllowRebalance::IndicesAllActive);
    }

    #[test]
    fn test_watermark_parsing() {
        assert_eq!(
            Watermark::try_from("85%".to_string()).unwrap(),
            Watermark::UsedPercent(85.0)
        );
        assert_eq!(
            Watermark::try_from("1gb".to_string()).unwrap(),
            Watermark::FreeBytes(1 << 30)
        );
        assert!(Watermark::try_from("lots".to_string()).is_err());
    }

    #[test]
    fn test_watermark_exceeded() {
        let usage = DiskUsage {
            total_bytes: 100,
            free_bytes: 8,
        };
        assert!(Watermark::UsedPercent(90.0).is_exceeded_by(&usage));
        assert!(!Watermark::UsedPercent(95.0).is_exceeded_by(&usage));
        assert!(Watermark::FreeBytes(10).is_exceeded_by(&usage));
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let mut settings = AllocationSettings::default();
        settings.disk.low_watermark = Watermark::UsedPercent(95.0);
        assert!(settings.validate().is_err());

        settings.disk.low_watermark = Watermark::UsedPercent(120.0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let settings = AllocationSettings {
            node_concurrent_recoveries: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = AllocationSettings {
            cluster_concurrent_rebalance: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(crate::Error::InvalidConfig(msg)) if msg.contains("cluster_concurrent_rebalance")
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[allocation]
node_concurrent_recoveries = 10

[allocation.disk]
low_watermark = "70%"
high_watermark = "80%"

[allocation.rebalance]
enable = "primaries"
allow = "always"
"#
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.allocation.node_concurrent_recoveries, 10);
        assert_eq!(cfg.allocation.node_initial_primaries_recoveries, 4);
        assert_eq!(cfg.allocation.disk.high_watermark, Watermark::UsedPercent(80.0));
        assert_eq!(cfg.allocation.rebalance.enable, RebalanceMode::Primaries);
        assert_eq!(cfg.allocation.rebalance.allow, AllowRebalance::Always);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[allocation]\ncluster_concurrent_recoveries = 0").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }
}
