use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{IssueKind, NodeId};

/// Remediation a recovery action performs against its target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionType {
    RestartService,
    SwitchRoute,
    ClearCache,
    ScaleUp,
    ScaleDown,
    Failover,
    QuarantineNode,
    /// Undo of `QuarantineNode`
    ReleaseQuarantine,
    NoAction,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::RestartService => "restart_service",
            ActionType::SwitchRoute => "switch_route",
            ActionType::ClearCache => "clear_cache",
            ActionType::ScaleUp => "scale_up",
            ActionType::ScaleDown => "scale_down",
            ActionType::Failover => "failover",
            ActionType::QuarantineNode => "quarantine_node",
            ActionType::ReleaseQuarantine => "release_quarantine",
            ActionType::NoAction => "no_action",
        }
    }

    /// The action that undoes this one. Restarts and cache clears leave
    /// nothing to undo.
    pub fn inverse(self) -> Option<ActionType> {
        match self {
            ActionType::ScaleUp => Some(ActionType::ScaleDown),
            ActionType::ScaleDown => Some(ActionType::ScaleUp),
            // back to the previous route / primary region
            ActionType::SwitchRoute => Some(ActionType::SwitchRoute),
            ActionType::Failover => Some(ActionType::Failover),
            ActionType::QuarantineNode => Some(ActionType::ReleaseQuarantine),
            ActionType::ReleaseQuarantine => Some(ActionType::QuarantineNode),
            ActionType::RestartService | ActionType::ClearCache | ActionType::NoAction => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a recovery action
///
/// `Pending -> Running -> {Succeeded, Failed}`. Terminal states never change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ActionStatus {
    /// Pending and running actions occupy their target.
    pub fn is_active(self) -> bool {
        matches!(self, ActionStatus::Pending | ActionStatus::Running)
    }

    fn can_become(self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (ActionStatus::Pending, ActionStatus::Running)
                | (ActionStatus::Running, ActionStatus::Succeeded | ActionStatus::Failed)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionStatus::Pending => write!(f, "PENDING"),
            ActionStatus::Running => write!(f, "RUNNING"),
            ActionStatus::Succeeded => write!(f, "SUCCEEDED"),
            ActionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// What caused an action to be committed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionOrigin {
    /// High-confidence anomaly, committed without a vote
    AutoExecute,
    /// Governance proposal that passed
    Proposal(Uuid),
    /// Undo of the action with this id
    Rollback(Uuid),
}

/// A remediation agreed on by the cluster. `id` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryAction {
    pub id: Uuid,
    pub action_type: ActionType,
    pub target_node: NodeId,
    pub issue: IssueKind,
    pub origin: ActionOrigin,
    pub status: ActionStatus,
    /// Every status the action has held, oldest first
    pub status_trail: Vec<ActionStatus>,
    pub attempt_count: u32,
    /// Leader that committed the action; only this node executes it
    pub assigned_executor: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure message
    pub error: Option<String>,
}

impl RecoveryAction {
    pub fn new(action_type: ActionType, target_node: &str, issue: IssueKind, origin: ActionOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            target_node: target_node.to_string(),
            issue,
            origin,
            status: ActionStatus::Pending,
            status_trail: vec![ActionStatus::Pending],
            attempt_count: 0,
            assigned_executor: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `next` if the lifecycle allows it. Returns false (and changes nothing) otherwise.
    pub fn transition(&mut self, next: ActionStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            ActionStatus::Running => self.started_at = Some(now),
            ActionStatus::Succeeded | ActionStatus::Failed => self.completed_at = Some(now),
            ActionStatus::Pending => {}
        }
        self.status = next;
        self.status_trail.push(next);
        true
    }

    /// Wall time from start to completion, the action's time-to-recover.
    pub fn recovery_secs(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.completed_at?);
        let ms = (end - start).num_milliseconds().max(0);
        Some(ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> RecoveryAction {
        RecoveryAction::new(ActionType::RestartService, "node-2", IssueKind::HighCpu, ActionOrigin::AutoExecute)
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut a = action();
        assert!(a.transition(ActionStatus::Running));
        assert!(a.transition(ActionStatus::Succeeded));
        assert_eq!(
            a.status_trail,
            vec![ActionStatus::Pending, ActionStatus::Running, ActionStatus::Succeeded]
        );
        assert!(a.recovery_secs().is_some());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut a = action();
        a.transition(ActionStatus::Running);
        a.transition(ActionStatus::Failed);
        assert!(!a.transition(ActionStatus::Running));
        assert!(!a.transition(ActionStatus::Succeeded));
        assert_eq!(a.status, ActionStatus::Failed);
    }

    #[test]
    fn test_inverse_pairs() {
        assert_eq!(ActionType::ScaleUp.inverse(), Some(ActionType::ScaleDown));
        assert_eq!(ActionType::ScaleDown.inverse(), Some(ActionType::ScaleUp));
        assert_eq!(ActionType::QuarantineNode.inverse(), Some(ActionType::ReleaseQuarantine));
        assert_eq!(ActionType::SwitchRoute.inverse(), Some(ActionType::SwitchRoute));
        assert_eq!(ActionType::RestartService.inverse(), None);
        assert_eq!(ActionType::ClearCache.inverse(), None);
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut a = action();
        assert!(!a.transition(ActionStatus::Succeeded));
        assert_eq!(a.status, ActionStatus::Pending);
        assert!(a.status.is_active());
    }
}
