//! EMA-based threshold adaptation.
//!
//! Every archived outcome becomes a signal: +1 relaxes (fast, clean recovery),
//! -1 tightens (failed or slow recovery), 0 leaves thresholds alone. Signals
//! are smoothed per metric with an exponential moving average `ema ∈ [-1, 1]`
//! and the published limit is `configured * (1 + max_adjustment * ema)`.

use std::collections::BTreeMap;

use crate::config::KnowledgeConfig;
use crate::detector::FeatureThresholds;
use crate::types::IssueKind;

use super::ActionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeSignal {
    Relax,
    Neutral,
    Tighten,
}

impl OutcomeSignal {
    pub fn classify(outcome: &ActionOutcome, config: &KnowledgeConfig) -> Self {
        if !outcome.success || outcome.recovery_secs > config.slow_recovery_secs {
            OutcomeSignal::Tighten
        } else if outcome.recovery_secs < config.fast_recovery_secs {
            OutcomeSignal::Relax
        } else {
            OutcomeSignal::Neutral
        }
    }

    fn value(self) -> f64 {
        match self {
            OutcomeSignal::Relax => 1.0,
            OutcomeSignal::Neutral => 0.0,
            OutcomeSignal::Tighten => -1.0,
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct AdaptiveState {
    metric_ema: BTreeMap<String, f64>,
    sigma_ema: f64,
    /// Highest knowledge sequence number already folded
    pub(super) cursor: u64,
}

fn ema(prev: f64, sample: f64, alpha: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * prev
}

impl AdaptiveState {
    pub(super) fn fold(&mut self, issue: IssueKind, signal: OutcomeSignal, alpha: f64) {
        let s = signal.value();
        if let Some(metric) = issue.feature() {
            let slot = self.metric_ema.entry(metric.to_string()).or_insert(0.0);
            *slot = ema(*slot, s, alpha);
        }
        self.sigma_ema = ema(self.sigma_ema, s, alpha);
    }

    pub(super) fn apply(&self, baseline: &FeatureThresholds, max_adjustment: f64) -> FeatureThresholds {
        let scale = |e: f64| 1.0 + max_adjustment * e.clamp(-1.0, 1.0);
        let limits = baseline
            .limits
            .iter()
            .map(|(metric, base)| {
                let e = self.metric_ema.get(metric).copied().unwrap_or(0.0);
                (metric.clone(), base * scale(e))
            })
            .collect();
        FeatureThresholds {
            limits,
            warning_sigma: baseline.warning_sigma * scale(self.sigma_ema),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_converges_toward_signal() {
        let mut state = AdaptiveState::default();
        for _ in 0..50 {
            state.fold(IssueKind::HighMemory, OutcomeSignal::Tighten, 0.2);
        }
        let t = state.apply(&FeatureThresholds::default(), 0.5);
        let mem = t.limit(crate::types::metrics::MEMORY_PERCENT).unwrap();
        assert!((mem - 42.5).abs() < 0.01);
        assert!(t.warning_sigma < 3.0);
    }

    #[test]
    fn test_generic_issue_moves_only_sigma() {
        let mut state = AdaptiveState::default();
        state.fold(IssueKind::Generic, OutcomeSignal::Relax, 0.5);
        let base = FeatureThresholds::default();
        let t = state.apply(&base, 0.5);
        assert_eq!(t.limits, base.limits);
        assert!((t.warning_sigma - 3.75).abs() < 1e-9);
    }
}
