//! Background services - periodic maintenance of the node's stores
//!
//! Runs as a tokio task next to the control cycle and stops on the
//! runtime's cancellation token.

pub mod maintenance;

pub use maintenance::{
    KnowledgeSweep, MaintenanceOutcome, MaintenanceTask, Maintainer, ProposalSweep, ThresholdRecompute,
};
