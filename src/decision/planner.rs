//! Issue classification and remediation choice

use std::sync::Arc;
use tracing::debug;

use crate::knowledge::KnowledgeStore;
use crate::types::{ActionType, AnomalyEvent, IssueKind};

/// Chooses what to do about an anomaly. Learned preferences from the
/// knowledge store win over the static table.
#[derive(Clone, Default)]
pub struct RemediationPlanner {
    knowledge: Option<Arc<KnowledgeStore>>,
}

impl RemediationPlanner {
    pub fn new(knowledge: Option<Arc<KnowledgeStore>>) -> Self {
        Self { knowledge }
    }

    pub fn classify(event: &AnomalyEvent) -> IssueKind {
        event
            .dominant_feature
            .as_deref()
            .map(IssueKind::from_feature)
            .unwrap_or(IssueKind::Generic)
    }

    pub fn default_action(issue: IssueKind) -> ActionType {
        match issue {
            IssueKind::HighCpu => ActionType::RestartService,
            IssueKind::HighMemory => ActionType::ClearCache,
            IssueKind::NetworkLoss | IssueKind::HighLatency => ActionType::SwitchRoute,
            IssueKind::Generic => ActionType::RestartService,
        }
    }

    pub fn plan(&self, event: &AnomalyEvent) -> (IssueKind, ActionType) {
        let issue = Self::classify(event);
        if let Some(learned) = self.knowledge.as_ref().and_then(|k| k.recommended_action(issue)) {
            debug!(%issue, action = %learned, "Using learned remediation");
            return (issue, learned);
        }
        (issue, Self::default_action(issue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnowledgeConfig;
    use crate::detector::{shared, FeatureThresholds};
    use crate::types::{metrics, ActionOrigin, ActionStatus, FeatureMap, RecoveryAction};

    fn event(feature: Option<&str>) -> AnomalyEvent {
        AnomalyEvent::new("n1", 0.9, 0.8, true, FeatureMap::new(), feature.map(String::from), "rule")
    }

    #[test]
    fn test_static_table() {
        let planner = RemediationPlanner::default();
        assert_eq!(
            planner.plan(&event(Some(metrics::CPU_PERCENT))),
            (IssueKind::HighCpu, ActionType::RestartService)
        );
        assert_eq!(
            planner.plan(&event(Some(metrics::MEMORY_PERCENT))),
            (IssueKind::HighMemory, ActionType::ClearCache)
        );
        assert_eq!(
            planner.plan(&event(Some(metrics::PACKET_LOSS_PERCENT))),
            (IssueKind::NetworkLoss, ActionType::SwitchRoute)
        );
        assert_eq!(planner.plan(&event(None)).0, IssueKind::Generic);
    }

    #[test]
    fn test_learned_action_wins() {
        let store = Arc::new(KnowledgeStore::new(
            KnowledgeConfig::default(),
            shared(FeatureThresholds::default()),
        ));
        let mut done = RecoveryAction::new(ActionType::ScaleUp, "n1", IssueKind::HighCpu, ActionOrigin::AutoExecute);
        done.transition(ActionStatus::Running);
        done.transition(ActionStatus::Succeeded);
        store.record_outcome(&done);

        let planner = RemediationPlanner::new(Some(store));
        assert_eq!(
            planner.plan(&event(Some(metrics::CPU_PERCENT))),
            (IssueKind::HighCpu, ActionType::ScaleUp)
        );
        // no history for memory, static table applies
        assert_eq!(planner.plan(&event(Some(metrics::MEMORY_PERCENT))).1, ActionType::ClearCache);
    }
}
