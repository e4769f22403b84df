//! Governance Ledger - quorum-weighted quadratic voting on remediations
//!
//! - `voting`: `voting_power = floor(sqrt(tokens))`, ballots and tallies
//! - `proposal`: lifecycle `OPEN -> {PASSED, FAILED, EXPIRED}` and the pass rule
//! - `ledger`: the keyed arena of proposals, serialized vote application,
//!   event-driven resolution waits and TTL eviction
//! - `ops`: proposal and ballot changes as replicated through consensus

mod ledger;
mod ops;
mod proposal;
mod voting;

pub use ledger::{GovernanceLedger, VoteReceipt};
pub use ops::GovernanceOp;
pub use proposal::{FailureReason, Proposal, ProposalKind, ProposalStatus, ProposalSummary};
pub use voting::{voting_power, Tally, Vote, VoteChoice, VoterRegistry};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Malformed proposal or vote, rejected before any state changed
    #[error("Invalid governance request: {0}")]
    Validation(String),

    #[error("Proposal {id} is closed ({status})")]
    ProposalClosed { id: Uuid, status: ProposalStatus },

    #[error("Proposal not found: {0}")]
    NotFound(Uuid),

    #[error("Proposal {0} expired without reaching quorum")]
    QuorumNotReached(Uuid),

    #[error("Proposal {0} was rejected")]
    Rejected(Uuid),

    #[error("Proposal {0} expired with no votes")]
    Expired(Uuid),

    #[error("Governance state lock poisoned")]
    Poisoned,
}
