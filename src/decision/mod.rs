//! Decision layer: what to do about a scored anomaly, and how
//!
//! `DecisionGate` maps (score, confidence) to one of four routes;
//! `RemediationPlanner` picks the issue class and the action type.

mod gate;
mod planner;

pub use gate::{Decision, DecisionGate, ANOMALY_BOUNDARY};
pub use planner::RemediationPlanner;
