use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{metrics, NodeId};

/// Named numeric metrics for one node at one instant.
///
/// A `BTreeMap` keeps iteration order stable so detector output is reproducible.
pub type FeatureMap = BTreeMap<String, f64>;

/// Output of one `AnomalyDetector::predict` call. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyEvent {
    pub node_id: NodeId,
    /// Normalized abnormality, 0.0 = nominal, 1.0 = maximally abnormal
    pub score: f64,
    /// Distance of the score from the decision boundary, in [0, 1]
    pub confidence: f64,
    pub is_anomaly: bool,
    /// Feature snapshot the score was computed from
    pub features: FeatureMap,
    /// Metric that contributed most to the score, if any
    pub dominant_feature: Option<String>,
    /// Backend that produced this event
    pub detector: String,
    pub timestamp: DateTime<Utc>,
}

impl AnomalyEvent {
    /// Build an event, clamping score and confidence into [0, 1].
    pub fn new(
        node_id: &str,
        score: f64,
        confidence: f64,
        is_anomaly: bool,
        features: FeatureMap,
        dominant_feature: Option<String>,
        detector: &str,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            score: clamp_unit(score),
            confidence: clamp_unit(confidence),
            is_anomaly,
            features,
            dominant_feature,
            detector: detector.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// A nominal reading with zero score and confidence (used when nothing can be scored).
    pub fn nominal(node_id: &str, features: FeatureMap, detector: &str) -> Self {
        Self::new(node_id, 0.0, 0.0, false, features, None, detector)
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// ============================================================================
// Issue classification
// ============================================================================

/// Class of problem an anomaly points at. Drives remediation planning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IssueKind {
    HighCpu,
    HighMemory,
    NetworkLoss,
    HighLatency,
    Generic,
}

impl IssueKind {
    /// Map a metric name to the issue it indicates.
    pub fn from_feature(feature: &str) -> Self {
        match feature {
            metrics::CPU_PERCENT => IssueKind::HighCpu,
            metrics::MEMORY_PERCENT => IssueKind::HighMemory,
            metrics::PACKET_LOSS_PERCENT => IssueKind::NetworkLoss,
            metrics::LATENCY_MS => IssueKind::HighLatency,
            _ => IssueKind::Generic,
        }
    }

    /// The metric this issue is measured on, if any.
    pub fn feature(self) -> Option<&'static str> {
        match self {
            IssueKind::HighCpu => Some(metrics::CPU_PERCENT),
            IssueKind::HighMemory => Some(metrics::MEMORY_PERCENT),
            IssueKind::NetworkLoss => Some(metrics::PACKET_LOSS_PERCENT),
            IssueKind::HighLatency => Some(metrics::LATENCY_MS),
            IssueKind::Generic => None,
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueKind::HighCpu => write!(f, "High CPU"),
            IssueKind::HighMemory => write!(f, "High Memory"),
            IssueKind::NetworkLoss => write!(f, "Network Loss"),
            IssueKind::HighLatency => write!(f, "High Latency"),
            IssueKind::Generic => write!(f, "Generic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_clamps_out_of_range_values() {
        let e = AnomalyEvent::new("n1", 1.7, f64::NAN, true, FeatureMap::new(), None, "rule");
        assert_eq!(e.score, 1.0);
        assert_eq!(e.confidence, 0.0);
    }

    #[test]
    fn test_issue_feature_mapping_is_symmetric() {
        for m in metrics::ALL {
            let issue = IssueKind::from_feature(m);
            assert_eq!(issue.feature(), Some(m));
        }
        assert_eq!(IssueKind::from_feature("disk_io"), IssueKind::Generic);
    }
}
