//! Consensus Coordinator - who may commit, and in what order
//!
//! A Raft-style state machine (follower / candidate / leader) with:
//! - randomized election timeouts and strict-majority votes
//! - a replicated log whose entries carry an idempotency key
//! - commit on majority acknowledgment, apply in log order, at most once per key
//! - leader lease: a leader without majority acknowledgment steps down
//! - applied prefixes compacted into a snapshot, shipped to lagging followers
//!
//! Only the leader appends. Followers forward commit requests to it.

mod coordinator;
mod election;
mod log;
mod rpc;

pub use coordinator::{CommittedEntry, ConsensusCoordinator, ConsensusStatus};
pub use election::{majority, CandidateState, ElectionTimer};
pub use log::{EntryPayload, LogEntry, ReplicatedLog};
pub use rpc::{
    AppendEntries, AppendReply, Forward, ForwardReply, InstallSnapshot, Message, Reply, RequestVote, VoteReply,
};

use thiserror::Error;

use crate::storage::StorageError;
use crate::transport::TransportError;
use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("No known leader")]
    NoLeader,

    #[error("Consensus request to {0} timed out")]
    Timeout(String),

    /// The entry was appended in an older term than this node now holds
    #[error("Stale term {seen} (current term {current})")]
    StaleTerm { seen: u64, current: u64 },

    #[error("Target {0} already has an action in flight")]
    TargetPending(String),

    /// The leader refused a forwarded request
    #[error("Rejected by {by}: {reason}")]
    Rejected { by: NodeId, reason: String },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<TransportError> for ConsensusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { peer, .. } => ConsensusError::Timeout(peer),
            other => ConsensusError::Transport(other),
        }
    }
}
