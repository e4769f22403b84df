//! Mesh Sentinel: autonomic self-healing for multi-node meshes
//!
//! Each node runs a MAPE-K loop (monitor, analyze, plan, execute over shared
//! knowledge). Recovery actions are agreed through a Raft-style replicated
//! log so that exactly one node runs each action, once.
//!
//! ## Architecture
//!
//! - **Detector**: scores per-node telemetry, rule or statistical backend
//! - **Decision**: confidence bands pick auto-execute, a proposal, or log-only
//! - **Governance**: quadratic voting on proposed remediations
//! - **Consensus**: leader election and replicated commit with idempotency keys
//! - **Executor**: circuit-breaker and rate-limit guarded remediation
//! - **Knowledge**: TTL-bounded history feeding adaptive thresholds

pub mod background;
pub mod config;
pub mod consensus;
pub mod control;
pub mod decision;
pub mod detector;
pub mod executor;
pub mod governance;
pub mod knowledge;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export the node runtime and its configuration
pub use config::NodeConfig;
pub use control::{CycleOutcome, NodeRuntime, StatusSnapshot};

// Re-export commonly used types
pub use types::{
    ActionOrigin, ActionStatus, ActionType, AnomalyEvent, FeatureMap, IssueKind, NodeId, NodeState,
    RecoveryAction, Role,
};

// Re-export the components
pub use consensus::{ConsensusCoordinator, ConsensusError};
pub use decision::{Decision, DecisionGate};
pub use detector::AnomalyDetector;
pub use executor::{CircuitBreaker, ExecutionError, RecoveryExecutor};
pub use governance::{GovernanceError, GovernanceLedger};
pub use knowledge::KnowledgeStore;
