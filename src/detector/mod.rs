//! Anomaly Detector - pluggable scoring behind a single `predict` contract
//!
//! ## Backends
//!
//! - `RuleBasedDetector`: deterministic per-metric thresholds
//! - `StatisticalDetector`: learned per-node baselines, z-score scoring
//! - `FallbackDetector`: prefers an optional learned backend and degrades to
//!   the rule backend whenever the learned one is absent or not ready
//!
//! All backends read their thresholds from a `SharedThresholds` handle, so the
//! knowledge store can retune them without coordinating with callers.

mod rules;
mod statistical;
mod thresholds;

pub use rules::RuleBasedDetector;
pub use statistical::{BaselineAccumulator, StatisticalDetector};
pub use thresholds::{shared, FeatureThresholds, SharedThresholds};

use std::sync::Arc;
use tracing::debug;

use crate::config::{DetectorBackend, DetectorConfig};
use crate::types::{AnomalyEvent, FeatureMap};

/// Scoring contract every backend satisfies.
///
/// `predict` has no side effects beyond reading detector state; learning from
/// nominal readings goes through `observe`.
pub trait AnomalyDetector: Send + Sync {
    /// Backend name for logging and event provenance
    fn name(&self) -> &'static str;

    /// Score one node's features.
    fn predict(&self, node_id: &str, features: &FeatureMap) -> AnomalyEvent;

    /// Whether this backend can score `node_id` right now.
    fn is_ready(&self, _node_id: &str) -> bool {
        true
    }

    /// Feed a reading judged nominal into any learned state.
    fn observe(&self, _node_id: &str, _features: &FeatureMap) {}
}

/// Distance of a score from the 0.5 decision boundary, mapped to [0, 1].
pub fn confidence_from_score(score: f64) -> f64 {
    ((score - 0.5).abs() * 2.0).clamp(0.0, 1.0)
}

/// Learned backend with rule-based degradation.
pub struct FallbackDetector {
    learned: Option<Arc<dyn AnomalyDetector>>,
    rules: RuleBasedDetector,
}

impl FallbackDetector {
    pub fn new(learned: Option<Arc<dyn AnomalyDetector>>, thresholds: SharedThresholds) -> Self {
        Self {
            learned,
            rules: RuleBasedDetector::new(thresholds),
        }
    }

    /// Build the detector stack a node config asks for.
    pub fn from_config(config: &DetectorConfig, thresholds: SharedThresholds) -> Self {
        let learned: Option<Arc<dyn AnomalyDetector>> = match config.backend {
            DetectorBackend::Rule => None,
            DetectorBackend::Statistical => {
                Some(Arc::new(StatisticalDetector::new(config, thresholds.clone())))
            }
        };
        Self::new(learned, thresholds)
    }

    fn active(&self, node_id: &str) -> &dyn AnomalyDetector {
        match &self.learned {
            Some(learned) if learned.is_ready(node_id) => learned.as_ref(),
            Some(learned) => {
                debug!(node = %node_id, backend = learned.name(), "Learned backend not ready, using rules");
                &self.rules
            }
            None => &self.rules,
        }
    }
}

impl AnomalyDetector for FallbackDetector {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn predict(&self, node_id: &str, features: &FeatureMap) -> AnomalyEvent {
        self.active(node_id).predict(node_id, features)
    }

    fn observe(&self, node_id: &str, features: &FeatureMap) {
        if let Some(learned) = &self.learned {
            learned.observe(node_id, features);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::metrics;

    struct NeverReady;

    impl AnomalyDetector for NeverReady {
        fn name(&self) -> &'static str {
            "never"
        }
        fn predict(&self, node_id: &str, features: &FeatureMap) -> AnomalyEvent {
            AnomalyEvent::new(node_id, 1.0, 1.0, true, features.clone(), None, self.name())
        }
        fn is_ready(&self, _node_id: &str) -> bool {
            false
        }
    }

    fn cpu(v: f64) -> FeatureMap {
        [(metrics::CPU_PERCENT.to_string(), v)].into_iter().collect()
    }

    #[test]
    fn test_confidence_is_distance_from_boundary() {
        assert_eq!(confidence_from_score(0.5), 0.0);
        assert_eq!(confidence_from_score(1.0), 1.0);
        assert_eq!(confidence_from_score(0.0), 1.0);
        assert!((confidence_from_score(0.95) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_unavailable_learned_backend_degrades_to_rules() {
        let d = FallbackDetector::new(Some(Arc::new(NeverReady)), shared(FeatureThresholds::default()));
        let e = d.predict("n1", &cpu(10.0));
        assert_eq!(e.detector, "rule");
        assert!(!e.is_anomaly);
    }

    #[test]
    fn test_missing_learned_backend_uses_rules() {
        let config = DetectorConfig {
            backend: DetectorBackend::Rule,
            ..DetectorConfig::default()
        };
        let d = FallbackDetector::from_config(&config, shared(FeatureThresholds::default()));
        assert_eq!(d.predict("n1", &cpu(99.0)).detector, "rule");
    }

    #[test]
    fn test_statistical_takes_over_once_ready() {
        let config = DetectorConfig {
            min_samples: 5,
            ..DetectorConfig::default()
        };
        let d = FallbackDetector::from_config(&config, shared(FeatureThresholds::default()));
        for _ in 0..5 {
            d.observe("n1", &cpu(40.0));
        }
        assert_eq!(d.predict("n1", &cpu(41.0)).detector, "statistical");
        assert_eq!(d.predict("n2", &cpu(41.0)).detector, "rule");
    }

    #[test]
    fn test_trait_object() {
        let d: Box<dyn AnomalyDetector> = Box::new(RuleBasedDetector::new(shared(FeatureThresholds::default())));
        assert!(d.is_ready("anything"));
        assert_eq!(d.name(), "rule");
    }
}
