//! Confidence-banded decision policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::DecisionConfig;
use crate::types::AnomalyEvent;

/// Score above which an event counts as anomalous
pub const ANOMALY_BOUNDARY: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Decision {
    /// Commit directly through consensus, no vote
    AutoExecute,
    /// Proposal with a short expiry
    EmergencyProposal { expiry: Duration },
    /// Proposal with a long expiry
    StandardProposal { expiry: Duration },
    LogOnly,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::AutoExecute => "auto_execute",
            Decision::EmergencyProposal { .. } => "emergency_proposal",
            Decision::StandardProposal { .. } => "standard_proposal",
            Decision::LogOnly => "log_only",
        }
    }
}

/// Pure function of its inputs and the injected thresholds.
#[derive(Debug, Clone)]
pub struct DecisionGate {
    config: DecisionConfig,
}

impl DecisionGate {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Map (score, confidence) to an action. Band edges are inclusive at the
    /// lower bound; a non-anomalous score or non-finite input logs only.
    pub fn decide(&self, score: f64, confidence: f64) -> Decision {
        if !score.is_finite() || !confidence.is_finite() || score <= ANOMALY_BOUNDARY {
            return Decision::LogOnly;
        }
        let c = &self.config;
        if confidence >= c.auto_execute_confidence {
            Decision::AutoExecute
        } else if confidence >= c.emergency_confidence {
            Decision::EmergencyProposal {
                expiry: Duration::from_secs(c.emergency_expiry_secs),
            }
        } else if confidence >= c.standard_confidence {
            Decision::StandardProposal {
                expiry: Duration::from_secs(c.standard_expiry_secs),
            }
        } else {
            Decision::LogOnly
        }
    }

    pub fn decide_event(&self, event: &AnomalyEvent) -> Decision {
        if !event.is_anomaly {
            return Decision::LogOnly;
        }
        self.decide(event.score, event.confidence)
    }
}

impl Default for DecisionGate {
    fn default() -> Self {
        Self::new(DecisionConfig::default())
    }
}
