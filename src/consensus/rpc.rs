//! Consensus wire messages
//!
//! Messages travel in-process (or over any `Transport`) as typed values;
//! they are serde-serializable so a network transport can frame them as JSON.

use serde::{Deserialize, Serialize};

use uuid::Uuid;

use super::log::{EntryPayload, LogEntry};
use crate::types::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteReply {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    /// Empty for a heartbeat
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendReply {
    pub term: u64,
    pub success: bool,
    /// Highest index known to match the leader (valid when `success`)
    pub match_index: u64,
    /// Follower's last index, lets the leader skip back past a gap
    pub last_log_index: u64,
}

/// Sent instead of AppendEntries when the entries a follower needs have
/// already been compacted away. Answered with an `AppendReply` whose
/// `match_index` is `last_included_index`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallSnapshot {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Recently applied idempotency keys with their log index, oldest first
    pub applied_keys: Vec<(Uuid, u64)>,
}

/// Commit request relayed from a follower to the leader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forward {
    pub payload: EntryPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ForwardReply {
    Accepted { index: u64 },
    NotLeader { leader_hint: Option<NodeId> },
    TargetPending { target: String },
    /// The leader refused the request for any other reason
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    RequestVote(RequestVote),
    AppendEntries(AppendEntries),
    InstallSnapshot(InstallSnapshot),
    Forward(Forward),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::AppendEntries(a) if a.entries.is_empty() => "heartbeat",
            Message::AppendEntries(_) => "append_entries",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::Forward(_) => "forward",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    Vote(VoteReply),
    Append(AppendReply),
    Forward(ForwardReply),
}
