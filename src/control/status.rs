use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::BreakerSnapshot;
use crate::governance::ProposalSummary;
use crate::knowledge::KnowledgeStats;
use crate::types::{NodeId, Role};

/// Read-only view of one node, serialisable for an external API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycles_completed: u64,
    /// Execution paused for lack of a leader
    pub observe_only: bool,
    pub breakers: Vec<BreakerSnapshot>,
    pub proposals: Vec<ProposalSummary>,
    pub executor_success_rate: Option<f64>,
    pub actions_in_flight: usize,
    pub knowledge: KnowledgeStats,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// One-line summary for periodic logs.
    pub fn headline(&self) -> String {
        format!(
            "{} {} term={} leader={} commit={} cycles={}{}",
            self.node_id,
            self.role,
            self.term,
            self.leader_id.as_deref().unwrap_or("-"),
            self.commit_index,
            self.cycles_completed,
            if self.observe_only { " [observe-only]" } else { "" },
        )
    }
}
