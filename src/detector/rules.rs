use crate::config::defaults::RULE_SATURATION_EXCESS;
use crate::types::{AnomalyEvent, FeatureMap};

use super::{confidence_from_score, AnomalyDetector, SharedThresholds};

/// Deterministic threshold detector.
///
/// Each metric with a configured limit is scored on its own:
/// - at or below the limit: `0.5 * value / limit` (never anomalous)
/// - above the limit: `0.5 + 0.5 * min(1, excess / RULE_SATURATION_EXCESS)`
///   where `excess` is the relative overshoot
///
/// The node's score is the worst metric's score.
pub struct RuleBasedDetector {
    thresholds: SharedThresholds,
}

impl RuleBasedDetector {
    pub fn new(thresholds: SharedThresholds) -> Self {
        Self { thresholds }
    }
}

pub(crate) fn metric_score(value: f64, limit: f64) -> f64 {
    if value <= limit {
        0.5 * (value / limit).max(0.0)
    } else {
        let excess = (value - limit) / limit;
        0.5 + 0.5 * (excess / RULE_SATURATION_EXCESS).min(1.0)
    }
}

impl AnomalyDetector for RuleBasedDetector {
    fn name(&self) -> &'static str {
        "rule"
    }

    fn predict(&self, node_id: &str, features: &FeatureMap) -> AnomalyEvent {
        let thresholds = self.thresholds.load();
        let mut worst: Option<(&str, f64)> = None;
        for (metric, &value) in features {
            let Some(limit) = thresholds.limit(metric) else {
                continue;
            };
            if !value.is_finite() || limit <= 0.0 {
                continue;
            }
            let score = metric_score(value, limit);
            if worst.map_or(true, |(_, s)| score > s) {
                worst = Some((metric.as_str(), score));
            }
        }

        match worst {
            None => AnomalyEvent::nominal(node_id, features.clone(), self.name()),
            Some((metric, score)) => {
                let is_anomaly = score > 0.5;
                AnomalyEvent::new(
                    node_id,
                    score,
                    confidence_from_score(score),
                    is_anomaly,
                    features.clone(),
                    is_anomaly.then(|| metric.to_string()),
                    self.name(),
                )
            }
        }
    }
}
