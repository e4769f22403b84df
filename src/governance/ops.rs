//! Governance changes carried in the replicated log
//!
//! Every node applies the same committed sequence of ops to its own ledger,
//! so proposals and ballots look the same wherever they are read.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::proposal::Proposal;
use super::voting::VoteChoice;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GovernanceOp {
    /// A drafted proposal; inserted on apply unless its id is already known
    Open(Proposal),
    Vote {
        /// Idempotency key of this ballot submission
        ballot_id: Uuid,
        proposal_id: Uuid,
        voter_id: String,
        choice: VoteChoice,
        tokens: u64,
    },
}

impl GovernanceOp {
    pub fn vote(proposal_id: Uuid, voter_id: &str, choice: VoteChoice, tokens: u64) -> Self {
        GovernanceOp::Vote {
            ballot_id: Uuid::new_v4(),
            proposal_id,
            voter_id: voter_id.to_string(),
            choice,
            tokens,
        }
    }

    /// Log idempotency key
    pub fn key(&self) -> Uuid {
        match self {
            GovernanceOp::Open(p) => p.id,
            GovernanceOp::Vote { ballot_id, .. } => *ballot_id,
        }
    }

    pub fn proposal_id(&self) -> Uuid {
        match self {
            GovernanceOp::Open(p) => p.id,
            GovernanceOp::Vote { proposal_id, .. } => *proposal_id,
        }
    }
}
