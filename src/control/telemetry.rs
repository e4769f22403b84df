//! Telemetry sources feeding the monitor phase

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use crate::types::{metrics, FeatureMap, IssueKind, NodeId};

/// Snapshot of every observed node, keyed by node id.
pub type TelemetrySnapshot = BTreeMap<NodeId, FeatureMap>;

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Called once per cycle.
    async fn collect(&self) -> Result<TelemetrySnapshot>;
}

/// Fixed readings, replaceable between cycles. Used by tests.
#[derive(Default)]
pub struct StaticTelemetry {
    readings: RwLock<TelemetrySnapshot>,
}

impl StaticTelemetry {
    pub fn new(readings: TelemetrySnapshot) -> Self {
        Self {
            readings: RwLock::new(readings),
        }
    }

    pub fn set(&self, node_id: &str, features: FeatureMap) {
        if let Ok(mut r) = self.readings.write() {
            r.insert(node_id.to_string(), features);
        }
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    fn source_name(&self) -> &'static str {
        "static"
    }

    async fn collect(&self) -> Result<TelemetrySnapshot> {
        let readings = self
            .readings
            .read()
            .map_err(|_| anyhow::anyhow!("telemetry lock poisoned"))?;
        Ok(readings.clone())
    }
}

/// (mean, std dev) of a healthy reading
#[derive(Debug, Clone, Copy)]
struct Profile {
    mean: f64,
    std: f64,
}

const HEALTHY: [(&str, Profile); 4] = [
    (metrics::CPU_PERCENT, Profile { mean: 35.0, std: 6.0 }),
    (metrics::MEMORY_PERCENT, Profile { mean: 50.0, std: 5.0 }),
    (metrics::PACKET_LOSS_PERCENT, Profile { mean: 0.5, std: 0.2 }),
    (metrics::LATENCY_MS, Profile { mean: 40.0, std: 8.0 }),
];

/// Reading of a metric while its fault is active; far enough past the
/// default limits to auto-execute.
fn fault_profile(issue: IssueKind) -> Option<(&'static str, Profile)> {
    let profile = match issue {
        IssueKind::HighCpu => Profile { mean: 99.0, std: 0.5 },
        IssueKind::HighMemory => Profile { mean: 96.0, std: 1.0 },
        IssueKind::NetworkLoss => Profile { mean: 12.0, std: 1.0 },
        IssueKind::HighLatency => Profile { mean: 450.0, std: 20.0 },
        IssueKind::Generic => return None,
    };
    Some((issue.feature()?, profile))
}

/// Gaussian readings around a healthy profile, with injectable faults.
pub struct SyntheticTelemetry {
    nodes: Vec<NodeId>,
    faults: DashMap<NodeId, IssueKind>,
    rng: Mutex<StdRng>,
}

impl SyntheticTelemetry {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self::with_rng(nodes, StdRng::from_entropy())
    }

    pub fn seeded(nodes: Vec<NodeId>, seed: u64) -> Self {
        Self::with_rng(nodes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(nodes: Vec<NodeId>, rng: StdRng) -> Self {
        Self {
            nodes,
            faults: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Drive `node_id`'s metric for `issue` far past its limit until cleared.
    pub fn inject_fault(&self, node_id: &str, issue: IssueKind) {
        tracing::info!(node = %node_id, %issue, "Fault injected");
        self.faults.insert(node_id.to_string(), issue);
    }

    pub fn clear_fault(&self, node_id: &str) {
        if self.faults.remove(node_id).is_some() {
            tracing::info!(node = %node_id, "Fault cleared");
        }
    }

    pub fn active_faults(&self) -> Vec<(NodeId, IssueKind)> {
        let mut out: Vec<_> = self.faults.iter().map(|e| (e.key().clone(), *e.value())).collect();
        out.sort();
        out
    }

    fn sample(rng: &mut StdRng, profile: Profile) -> f64 {
        let value = Normal::new(profile.mean, profile.std)
            .map(|n| n.sample(rng))
            .unwrap_or(profile.mean);
        value.max(0.0)
    }
}

#[async_trait]
impl TelemetrySource for SyntheticTelemetry {
    fn source_name(&self) -> &'static str {
        "synthetic"
    }

    async fn collect(&self) -> Result<TelemetrySnapshot> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| anyhow::anyhow!("telemetry rng poisoned"))?;
        let mut snapshot = TelemetrySnapshot::new();
        for node in &self.nodes {
            let fault = self.faults.get(node).and_then(|f| fault_profile(*f));
            let mut features = FeatureMap::new();
            for (metric, healthy) in HEALTHY {
                let profile = match fault {
                    Some((faulty, p)) if faulty == metric => p,
                    _ => healthy,
                };
                let mut value = Self::sample(&mut rng, profile);
                if metric.ends_with("_percent") {
                    value = value.min(100.0);
                }
                features.insert(metric.to_string(), value);
            }
            snapshot.insert(node.clone(), features);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthy_readings_stay_under_default_limits() {
        let source = SyntheticTelemetry::seeded(vec!["a".into(), "b".into()], 7);
        for _ in 0..20 {
            let snapshot = source.collect().await.unwrap();
            assert_eq!(snapshot.len(), 2);
            for features in snapshot.values() {
                assert!(features[metrics::CPU_PERCENT] < 90.0);
                assert!(features[metrics::PACKET_LOSS_PERCENT] < 5.0);
            }
        }
    }

    #[tokio::test]
    async fn test_fault_raises_only_its_metric() {
        let source = SyntheticTelemetry::seeded(vec!["a".into(), "b".into()], 7);
        source.inject_fault("a", IssueKind::HighCpu);
        let snapshot = source.collect().await.unwrap();
        assert!(snapshot["a"][metrics::CPU_PERCENT] > 95.0);
        assert!(snapshot["a"][metrics::MEMORY_PERCENT] < 85.0);
        assert!(snapshot["b"][metrics::CPU_PERCENT] < 90.0);

        source.clear_fault("a");
        assert!(source.active_faults().is_empty());
        let snapshot = source.collect().await.unwrap();
        assert!(snapshot["a"][metrics::CPU_PERCENT] < 90.0);
    }

    #[tokio::test]
    async fn test_static_source_returns_what_was_set() {
        let source = StaticTelemetry::default();
        let mut f = FeatureMap::new();
        f.insert(metrics::CPU_PERCENT.into(), 12.0);
        source.set("n1", f.clone());
        assert_eq!(source.collect().await.unwrap()["n1"], f);
    }
}
