//! Shard copies and their state machine
//!
//! A [`ShardRouting`] is an immutable value. Every transition returns a new
//! value and fails with [`Error::InvariantViolation`] when called from a
//! state it does not apply to, since that can only be a caller bug.

use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical shard slot of an index: `(index name, shard number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShardState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Unassigned => write!(f, "UNASSIGNED"),
            ShardState::Initializing => write!(f, "INITIALIZING"),
            ShardState::Started => write!(f, "STARTED"),
            ShardState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Why a copy is unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    IndexCreated,
    ReplicaAdded,
    NodeLeft,
    AllocationFailed,
    RerouteCancelled,
    PrimaryFailed,
    RelocationAbandoned,
}

impl fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnassignedReason::IndexCreated => "index_created",
            UnassignedReason::ReplicaAdded => "replica_added",
            UnassignedReason::NodeLeft => "node_left",
            UnassignedReason::AllocationFailed => "allocation_failed",
            UnassignedReason::RerouteCancelled => "reroute_cancelled",
            UnassignedReason::PrimaryFailed => "primary_failed",
            UnassignedReason::RelocationAbandoned => "relocation_abandoned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The copy was active when it became unassigned. For a primary this
    /// means its data is gone and only an explicit command may allocate it.
    #[serde(default)]
    pub lost_active_copy: bool,
}

impl UnassignedInfo {
    pub fn new(reason: UnassignedReason, at: DateTime<Utc>) -> Self {
        Self {
            reason,
            at,
            message: None,
            lost_active_copy: false,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// One physical copy of a shard.
///
/// For a relocation the source copy is `RELOCATING` with `relocating_node_id`
/// pointing at the target; the target copy is `INITIALIZING` with
/// `relocating_node_id` pointing back at the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    shard_id: ShardId,
    primary: bool,
    state: ShardState,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    relocating_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unassigned_info: Option<UnassignedInfo>,
}

impl ShardRouting {
    /// A fresh unassigned copy.
    pub fn new_unassigned(shard_id: ShardId, primary: bool, info: UnassignedInfo) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardState::Unassigned,
            current_node_id: None,
            relocating_node_id: None,
            unassigned_info: Some(info),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn index(&self) -> &str {
        &self.shard_id.index
    }

    pub fn primary(&self) -> bool {
        self.primary
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn current_node_id(&self) -> Option<&str> {
        self.current_node_id.as_deref()
    }

    pub fn relocating_node_id(&self) -> Option<&str> {
        self.relocating_node_id.as_deref()
    }

    pub fn unassigned_info(&self) -> Option<&UnassignedInfo> {
        self.unassigned_info.as_ref()
    }

    pub fn unassigned(&self) -> bool {
        self.state == ShardState::Unassigned
    }

    pub fn assigned_to_node(&self) -> bool {
        self.current_node_id.is_some()
    }

    pub fn initializing(&self) -> bool {
        self.state == ShardState::Initializing
    }

    pub fn started(&self) -> bool {
        self.state == ShardState::Started
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardState::Relocating
    }

    /// Started or relocating: the copy holds a full set of data.
    pub fn active(&self) -> bool {
        matches!(self.state, ShardState::Started | ShardState::Relocating)
    }

    /// The initializing half of an in-flight relocation.
    pub fn is_relocation_target(&self) -> bool {
        self.state == ShardState::Initializing && self.relocating_node_id.is_some()
    }

    /// Builds the derived target copy of a relocating source.
    pub fn relocation_target(&self) -> Option<ShardRouting> {
        if self.state != ShardState::Relocating {
            return None;
        }
        Some(ShardRouting {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardState::Initializing,
            current_node_id: self.relocating_node_id.clone(),
            relocating_node_id: self.current_node_id.clone(),
            unassigned_info: None,
        })
    }

    /// UNASSIGNED -> INITIALIZING on `node_id`.
    pub fn initialize(&self, node_id: &str) -> Result<ShardRouting> {
        self.expect_state(ShardState::Unassigned, "initialize")?;
        Ok(ShardRouting {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardState::Initializing,
            current_node_id: Some(node_id.to_string()),
            relocating_node_id: None,
            unassigned_info: None,
        })
    }

    /// INITIALIZING -> STARTED. A relocation target forgets its source.
    pub fn move_to_started(&self) -> Result<ShardRouting> {
        self.expect_state(ShardState::Initializing, "start")?;
        Ok(ShardRouting {
            state: ShardState::Started,
            relocating_node_id: None,
            ..self.clone()
        })
    }

    /// STARTED -> RELOCATING towards `target_node_id`.
    pub fn relocate(&self, target_node_id: &str) -> Result<ShardRouting> {
        self.expect_state(ShardState::Started, "relocate")?;
        if self.current_node_id.as_deref() == Some(target_node_id) {
            return Err(Error::InvariantViolation(format!(
                "{} cannot relocate onto its own node [{}]",
                self.shard_id, target_node_id
            )));
        }
        Ok(ShardRouting {
            state: ShardState::Relocating,
            relocating_node_id: Some(target_node_id.to_string()),
            ..self.clone()
        })
    }

    /// RELOCATING -> STARTED on the original node.
    pub fn cancel_relocation(&self) -> Result<ShardRouting> {
        self.expect_state(ShardState::Relocating, "cancel relocation of")?;
        Ok(ShardRouting {
            state: ShardState::Started,
            relocating_node_id: None,
            ..self.clone()
        })
    }

    /// Any assigned state -> UNASSIGNED. Relocation targets must be cancelled instead.
    pub fn move_to_unassigned(&self, info: UnassignedInfo) -> Result<ShardRouting> {
        if self.unassigned() || self.is_relocation_target() {
            return Err(Error::InvariantViolation(format!(
                "cannot unassign {} in state {} (relocation target: {})",
                self.shard_id,
                self.state,
                self.is_relocation_target()
            )));
        }
        Ok(ShardRouting::new_unassigned(
            self.shard_id.clone(),
            self.primary,
            UnassignedInfo {
                lost_active_copy: self.active(),
                ..info
            },
        ))
    }

    /// Flip an active replica to primary. State and placement are untouched.
    pub fn move_to_primary(&self) -> Result<ShardRouting> {
        if self.primary {
            return Err(Error::InvariantViolation(format!(
                "{} on [{}] is already primary",
                self.shard_id,
                self.current_node_id.as_deref().unwrap_or("-")
            )));
        }
        Ok(ShardRouting {
            primary: true,
            ..self.clone()
        })
    }

    pub fn move_to_replica(&self) -> ShardRouting {
        ShardRouting {
            primary: false,
            ..self.clone()
        }
    }

    fn expect_state(&self, expected: ShardState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvariantViolation(format!(
                "cannot {} {}: state is {}, expected {}",
                action, self.shard_id, self.state, expected
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, node[{}], {}[{}], s[{}]",
            self.shard_id,
            self.current_node_id.as_deref().unwrap_or("-"),
            if self.relocating_node_id.is_some() {
                "relocating "
            } else {
                ""
            },
            if self.primary { "P" } else { "R" },
            self.state
        )?;
        if let Some(target) = &self.relocating_node_id {
            write!(f, ", relocating[{}]", target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unassigned_primary() -> ShardRouting {
        ShardRouting::new_unassigned(
            ShardId::new("test", 0),
            true,
            UnassignedInfo::new(UnassignedReason::IndexCreated, Utc::now()),
        )
    }

    #[test]
    fn test_lifecycle() {
        let shard = unassigned_primary();
        assert!(shard.unassigned_info().is_some());

        let init = shard.initialize("node1").unwrap();
        assert_eq!(init.state(), ShardState::Initializing);
        assert_eq!(init.current_node_id(), Some("node1"));
        assert!(init.unassigned_info().is_none());

        let started = init.move_to_started().unwrap();
        assert!(started.active());

        let relocating = started.relocate("node2").unwrap();
        assert_eq!(relocating.relocating_node_id(), Some("node2"));

        let target = relocating.relocation_target().unwrap();
        assert!(target.is_relocation_target());
        assert_eq!(target.current_node_id(), Some("node2"));
        assert_eq!(target.relocating_node_id(), Some("node1"));
        assert!(target.primary());

        let back = relocating.cancel_relocation().unwrap();
        assert_eq!(back, started);
    }

    #[test]
    fn test_invalid_transitions_are_invariant_violations() {
        let shard = unassigned_primary();
        assert!(matches!(
            shard.move_to_started(),
            Err(Error::InvariantViolation(_))
        ));
        assert!(shard.relocate("node1").is_err());

        let started = shard
            .initialize("node1")
            .and_then(|s| s.move_to_started())
            .unwrap();
        assert!(started.relocate("node1").is_err());
        assert!(started.move_to_primary().is_err());

        let target = started.relocate("node2").unwrap().relocation_target().unwrap();
        let info = UnassignedInfo::new(UnassignedReason::NodeLeft, Utc::now());
        assert!(target.move_to_unassigned(info).is_err());
    }

    #[test]
    fn test_unassigning_active_copy_is_remembered() {
        let info = UnassignedInfo::new(UnassignedReason::NodeLeft, Utc::now());
        let init = unassigned_primary().initialize("node1").unwrap();
        let lost = init.move_to_unassigned(info.clone()).unwrap();
        assert!(!lost.unassigned_info().unwrap().lost_active_copy);

        let started = init.move_to_started().unwrap();
        let lost = started.move_to_unassigned(info).unwrap();
        assert!(lost.unassigned_info().unwrap().lost_active_copy);
        assert!(lost.primary());
    }

    #[test]
    fn test_display() {
        let started = unassigned_primary()
            .initialize("node1")
            .and_then(|s| s.move_to_started())
            .unwrap();
        assert_eq!(started.to_string(), "[test][0], node[node1], [P], s[STARTED]");
    }
}
