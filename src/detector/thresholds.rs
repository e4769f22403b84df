//! Detector thresholds shared between the detectors (readers) and the
//! knowledge store (writer) through an `ArcSwap`.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::DetectorConfig;
use crate::types::metrics;

/// Per-metric limits plus the statistical sensitivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureThresholds {
    /// Metric name -> value above which the metric is anomalous
    pub limits: BTreeMap<String, f64>,
    /// Z-score boundary for the statistical detector
    pub warning_sigma: f64,
}

impl FeatureThresholds {
    pub fn from_config(config: &DetectorConfig) -> Self {
        let limits = [
            (metrics::CPU_PERCENT, config.cpu_percent),
            (metrics::MEMORY_PERCENT, config.memory_percent),
            (metrics::PACKET_LOSS_PERCENT, config.packet_loss_percent),
            (metrics::LATENCY_MS, config.latency_ms),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            limits,
            warning_sigma: config.warning_sigma,
        }
    }

    pub fn limit(&self, metric: &str) -> Option<f64> {
        self.limits.get(metric).copied()
    }
}

impl Default for FeatureThresholds {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

/// Lock-free handle: detectors `load()` per prediction, the knowledge store `store()`s updates.
pub type SharedThresholds = Arc<ArcSwap<FeatureThresholds>>;

pub fn shared(thresholds: FeatureThresholds) -> SharedThresholds {
    Arc::new(ArcSwap::from_pointee(thresholds))
}
