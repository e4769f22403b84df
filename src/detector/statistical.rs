//! Learned per-node baselines with z-score scoring.
//!
//! Baselines are accumulated with Welford's online algorithm from readings the
//! runtime judged nominal. A metric participates in scoring once its baseline
//! holds `min_samples` readings; until then the detector reports itself not
//! ready for that node and the fallback detector answers instead.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::config::DetectorConfig;
use crate::types::{AnomalyEvent, FeatureMap};

use super::{confidence_from_score, AnomalyDetector, SharedThresholds};

/// Running mean/variance for one (node, metric) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaselineAccumulator {
    pub count: usize,
    pub mean: f64,
    /// Running M2 for variance (Welford's algorithm)
    pub m2: f64,
}

impl BaselineAccumulator {
    /// Add a sample. Non-finite values are rejected so a single NaN cannot
    /// poison mean and m2.
    pub fn add_sample(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
        true
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Upward deviation in standard deviations, with `std_floor` guarding flat baselines.
    pub fn z_score(&self, value: f64, std_floor: f64) -> f64 {
        (value - self.mean) / self.std_dev().max(std_floor)
    }
}

/// Statistical detector over learned baselines
pub struct StatisticalDetector {
    thresholds: SharedThresholds,
    baselines: Mutex<HashMap<(String, String), BaselineAccumulator>>,
    min_samples: usize,
    std_floor: f64,
    unit_normal: Option<Normal>,
}

impl StatisticalDetector {
    pub fn new(config: &DetectorConfig, thresholds: SharedThresholds) -> Self {
        Self {
            thresholds,
            baselines: Mutex::new(HashMap::new()),
            min_samples: config.min_samples.max(2),
            std_floor: config.min_std_floor,
            unit_normal: Normal::new(0.0, 1.0).ok(),
        }
    }

    /// Number of (node, metric) baselines that are ready for scoring.
    pub fn ready_baselines(&self) -> usize {
        self.baselines
            .lock()
            .map(|b| b.values().filter(|a| a.count >= self.min_samples).count())
            .unwrap_or(0)
    }

    fn cdf(&self, x: f64) -> f64 {
        match &self.unit_normal {
            Some(n) => n.cdf(x),
            // Logistic approximation of the normal CDF
            None => 1.0 / (1.0 + (-1.702 * x).exp()),
        }
    }
}

impl AnomalyDetector for StatisticalDetector {
    fn name(&self) -> &'static str {
        "statistical"
    }

    fn is_ready(&self, node_id: &str) -> bool {
        let Ok(baselines) = self.baselines.lock() else {
            return false;
        };
        baselines
            .iter()
            .any(|((node, _), acc)| node == node_id && acc.count >= self.min_samples)
    }

    fn observe(&self, node_id: &str, features: &FeatureMap) {
        let Ok(mut baselines) = self.baselines.lock() else {
            return;
        };
        for (metric, &value) in features {
            baselines
                .entry((node_id.to_string(), metric.clone()))
                .or_default()
                .add_sample(value);
        }
    }

    fn predict(&self, node_id: &str, features: &FeatureMap) -> AnomalyEvent {
        let sigma = self.thresholds.load().warning_sigma;
        let mut worst: Option<(String, f64)> = None;
        {
            let Ok(baselines) = self.baselines.lock() else {
                return AnomalyEvent::nominal(node_id, features.clone(), self.name());
            };
            for (metric, &value) in features {
                if !value.is_finite() {
                    continue;
                }
                let Some(acc) = baselines.get(&(node_id.to_string(), metric.clone())) else {
                    continue;
                };
                if acc.count < self.min_samples {
                    continue;
                }
                let z = acc.z_score(value, self.std_floor);
                if worst.as_ref().map_or(true, |(_, best)| z > *best) {
                    worst = Some((metric.clone(), z));
                }
            }
        }

        let Some((metric, z)) = worst else {
            return AnomalyEvent::nominal(node_id, features.clone(), self.name());
        };
        let score = self.cdf(z - sigma);
        let is_anomaly = z > sigma;
        if is_anomaly {
            debug!(node = %node_id, metric = %metric, z = %format!("{z:.2}"), "Baseline deviation");
        }
        AnomalyEvent::new(
            node_id,
            score,
            confidence_from_score(score),
            is_anomaly,
            features.clone(),
            is_anomaly.then_some(metric),
            self.name(),
        )
    }
}
