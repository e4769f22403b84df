//! Remediation backends
//!
//! The executor decides *whether* and *when* an action runs; a
//! `RemediationHandler` performs it against the real (or simulated) system.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::types::RecoveryAction;

#[async_trait]
pub trait RemediationHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Perform the action. Any error counts as a failed attempt.
    async fn remediate(&self, action: &RecoveryAction) -> Result<()>;
}

/// Stand-in backend for simulation and tests: sleeps for a configurable
/// latency and fails with a configurable probability, or always for targets
/// marked as broken.
pub struct SimulatedRemediation {
    failure_probability: f64,
    latency: Duration,
    rng: Mutex<StdRng>,
    broken_targets: RwLock<HashSet<String>>,
    invocations: AtomicU64,
}

impl SimulatedRemediation {
    pub fn new(failure_probability: f64, latency: Duration) -> Self {
        Self::with_rng(failure_probability, latency, StdRng::from_entropy())
    }

    pub fn seeded(failure_probability: f64, latency: Duration, seed: u64) -> Self {
        Self::with_rng(failure_probability, latency, StdRng::seed_from_u64(seed))
    }

    fn with_rng(failure_probability: f64, latency: Duration, rng: StdRng) -> Self {
        let p = if failure_probability.is_finite() {
            failure_probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            failure_probability: p,
            latency,
            rng: Mutex::new(rng),
            broken_targets: RwLock::new(HashSet::new()),
            invocations: AtomicU64::new(0),
        }
    }

    /// Every remediation against `target` fails until `repair` is called.
    pub fn break_target(&self, target: &str) {
        if let Ok(mut t) = self.broken_targets.write() {
            t.insert(target.to_string());
        }
    }

    pub fn repair(&self, target: &str) {
        if let Ok(mut t) = self.broken_targets.write() {
            t.remove(target);
        }
    }

    /// How many times `remediate` actually ran.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn roll_failure(&self) -> bool {
        if self.failure_probability <= 0.0 {
            return false;
        }
        self.rng
            .lock()
            .map(|mut r| r.gen_bool(self.failure_probability))
            .unwrap_or(false)
    }
}

impl Default for SimulatedRemediation {
    fn default() -> Self {
        Self::new(0.0, Duration::from_millis(20))
    }
}

#[async_trait]
impl RemediationHandler for SimulatedRemediation {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn remediate(&self, action: &RecoveryAction) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let broken = self
            .broken_targets
            .read()
            .map(|t| t.contains(&action.target_node))
            .unwrap_or(false);
        if broken {
            bail!("{} on {} failed: target unresponsive", action.action_type, action.target_node);
        }
        if self.roll_failure() {
            bail!("{} on {} failed: simulated fault", action.action_type, action.target_node);
        }
        tracing::debug!(action = %action.id, kind = %action.action_type, target = %action.target_node, "Remediation applied");
        Ok(())
    }
}
