//! Shared data structures for the self-healing control loop
//!
//! This module defines the records that flow through one MAPE-K cycle:
//! - Monitor: `FeatureMap` snapshots per node
//! - Analyze: `AnomalyEvent` (detector output)
//! - Plan: `IssueKind` + `ActionType`
//! - Execute: `RecoveryAction` (committed through consensus, run by the executor)
//! - Cluster membership: `NodeState` / `Role`

mod action;
mod anomaly;
mod recent;

pub use action::*;
pub use anomaly::*;
pub use recent::RecentKeys;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a mesh node. Node ids double as consensus member ids.
pub type NodeId = String;

/// Well-known metric names emitted by telemetry sources.
pub mod metrics {
    pub const CPU_PERCENT: &str = "cpu_percent";
    pub const MEMORY_PERCENT: &str = "memory_percent";
    pub const PACKET_LOSS_PERCENT: &str = "packet_loss_percent";
    pub const LATENCY_MS: &str = "latency_ms";

    /// All metrics the built-in detectors carry thresholds for.
    pub const ALL: [&str; 4] = [CPU_PERCENT, MEMORY_PERCENT, PACKET_LOSS_PERCENT, LATENCY_MS];
}

// ============================================================================
// Consensus membership
// ============================================================================

/// Consensus role of a node within the current term
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Leader => write!(f, "LEADER"),
        }
    }
}

/// Membership view of a single node as seen by its own coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeState {
    pub id: NodeId,
    pub role: Role,
    /// Last time a valid leader heartbeat was accepted (None for a fresh node or the leader itself)
    pub last_heartbeat: Option<DateTime<Utc>>,
}
