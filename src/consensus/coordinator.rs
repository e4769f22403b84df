use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::election::{majority, CandidateState, ElectionTimer};
use super::log::{EntryPayload, LogEntry, ReplicatedLog};
use super::rpc::{
    AppendEntries, AppendReply, Forward, ForwardReply, InstallSnapshot, Message, Reply, RequestVote, VoteReply,
};
use super::ConsensusError;
use crate::config::ConsensusConfig;
use crate::storage::{PersistedConsensus, StateStore};
use crate::transport::{send_with_retry, MessageHandler, RetryPolicy, Transport};
use crate::governance::GovernanceOp;
use crate::types::{NodeId, NodeState, RecentKeys, RecoveryAction, Role};

/// Upper bound on entries shipped in one AppendEntries
const MAX_BATCH: usize = 64;

/// A committed action or governance op, emitted once per idempotency key on
/// this node. Noops are not emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

impl CommittedEntry {
    pub fn action(&self) -> Option<&RecoveryAction> {
        match &self.payload {
            EntryPayload::Action(a) => Some(a),
            _ => None,
        }
    }
}

/// Point-in-time view for the status surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_log_index: u64,
    pub applied_index: u64,
    /// Entries up to here are folded into the snapshot
    pub snapshot_index: u64,
    /// Size of the applied idempotency-key window
    pub applied_keys: usize,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct PeerProgress {
    next_index: u64,
    match_index: u64,
    last_ack: Option<Instant>,
    in_flight: bool,
}

struct RaftState {
    term: u64,
    voted_for: Option<NodeId>,
    role: Role,
    leader_id: Option<NodeId>,
    log: ReplicatedLog,
    applied_index: u64,
    applied_keys: RecentKeys,
    election: ElectionTimer,
    candidate: Option<CandidateState>,
    progress: HashMap<NodeId, PeerProgress>,
    leader_since: Option<Instant>,
    last_broadcast: Option<Instant>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_leader_contact: Option<Instant>,
    /// Leader only: target -> action id with an entry not yet released
    open_targets: HashMap<String, Uuid>,
}

enum Outbound {
    Nothing,
    Votes(RequestVote),
    /// AppendEntries or InstallSnapshot, per peer
    Appends(Vec<(NodeId, Message)>),
}

/// Raft-style leader election and replicated commit log.
///
/// One instance per node process, shared by `Arc` with every decision path.
/// The state mutex is never held across a network call: RPCs are built under
/// the lock, sent from spawned tasks, and their replies re-enter through
/// `on_vote_reply` / `on_append_reply`.
pub struct ConsensusCoordinator {
    id: NodeId,
    peers: Vec<NodeId>,
    config: ConsensusConfig,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn StateStore>>,
    state: Mutex<RaftState>,
    applied_tx: mpsc::UnboundedSender<CommittedEntry>,
    applied_rx: Mutex<Option<mpsc::UnboundedReceiver<CommittedEntry>>>,
    me: Weak<ConsensusCoordinator>,
}

impl ConsensusCoordinator {
    /// Build the coordinator and restore any persisted state from `store`.
    pub fn new(
        id: &str,
        peers: &[NodeId],
        config: ConsensusConfig,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Arc<Self> {
        let mut peer_ids: Vec<NodeId> = peers.iter().filter(|p| p.as_str() != id).cloned().collect();
        peer_ids.sort();
        peer_ids.dedup();

        let now = Instant::now();
        let election = ElectionTimer::new(
            Duration::from_millis(config.election_timeout_min_ms),
            Duration::from_millis(config.election_timeout_max_ms),
            now,
        );
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let applied_keys = RecentKeys::new(config.applied_key_window);

        let coordinator = Arc::new_cyclic(|me| Self {
            id: id.to_string(),
            peers: peer_ids,
            config,
            transport,
            store,
            state: Mutex::new(RaftState {
                term: 0,
                voted_for: None,
                role: Role::Follower,
                leader_id: None,
                log: ReplicatedLog::new(),
                applied_index: 0,
                applied_keys,
                election,
                candidate: None,
                progress: HashMap::new(),
                leader_since: None,
                last_broadcast: None,
                last_heartbeat: None,
                last_leader_contact: None,
                open_targets: HashMap::new(),
            }),
            applied_tx,
            applied_rx: Mutex::new(Some(applied_rx)),
            me: me.clone(),
        });

        match coordinator.load_state() {
            Ok(true) => {}
            Ok(false) => debug!(node = %id, "No persisted consensus state"),
            Err(e) => warn!(node = %id, error = %e, "Failed to restore consensus state, starting fresh"),
        }
        info!(
            node = %id,
            peers = coordinator.peers.len(),
            term = coordinator.current_term(),
            "Consensus coordinator ready"
        );
        coordinator
    }

    fn lock(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn quorum(&self) -> usize {
        majority(self.peers.len() + 1)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }

    /// Appends get one attempt; the next heartbeat is the retry.
    fn append_policy(&self) -> RetryPolicy {
        let timeout = Duration::from_millis(
            (self.config.heartbeat_interval_ms * 2).min(self.config.rpc_timeout_ms),
        );
        RetryPolicy::once(timeout)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Hand out the committed-entry stream. Only the first caller gets it.
    pub fn take_applied_receiver(&self) -> Option<mpsc::UnboundedReceiver<CommittedEntry>> {
        self.applied_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    // ========================================================================
    // Timer-driven transitions
    // ========================================================================

    /// Advance timers: start an election, send heartbeats, or give up a lease.
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut persist = false;
        let outbound = {
            let mut guard = self.lock();
            let st = &mut *guard;
            match st.role {
                Role::Leader => {
                    if !self.lease_holds(st, now) {
                        warn!(
                            node = %self.id,
                            term = st.term,
                            "No majority acknowledgment within lease, stepping down"
                        );
                        let term = st.term;
                        self.become_follower(st, term, None, now);
                        Outbound::Nothing
                    } else if st
                        .last_broadcast
                        .map_or(true, |t| now.duration_since(t) >= Duration::from_millis(self.config.heartbeat_interval_ms))
                    {
                        Outbound::Appends(self.build_appends(st, now))
                    } else {
                        Outbound::Nothing
                    }
                }
                Role::Follower | Role::Candidate => {
                    if st.election.expired(now) {
                        persist = true;
                        self.start_election(st, now)
                    } else {
                        Outbound::Nothing
                    }
                }
            }
        };
        if persist {
            self.persist();
        }
        self.dispatch(outbound);
    }

    fn lease_holds(&self, st: &RaftState, now: Instant) -> bool {
        let lease = Duration::from_millis(self.config.leader_lease_ms);
        if st.leader_since.map_or(true, |t| now.duration_since(t) < lease) {
            return true;
        }
        let fresh = st
            .progress
            .values()
            .filter(|p| p.last_ack.is_some_and(|t| now.duration_since(t) < lease))
            .count();
        fresh + 1 >= self.quorum()
    }

    fn start_election(&self, st: &mut RaftState, now: Instant) -> Outbound {
        st.term += 1;
        st.role = Role::Candidate;
        st.voted_for = Some(self.id.clone());
        st.leader_id = None;
        st.candidate = Some(CandidateState::new(&self.id, st.term));
        st.election.reset(now);
        info!(node = %self.id, term = st.term, "Election timeout, starting election");

        if self.quorum() <= 1 {
            return Outbound::Appends(self.become_leader(st, now));
        }
        Outbound::Votes(RequestVote {
            term: st.term,
            candidate_id: self.id.clone(),
            last_log_index: st.log.last_index(),
            last_log_term: st.log.last_term(),
        })
    }

    fn become_leader(&self, st: &mut RaftState, now: Instant) -> Vec<(NodeId, Message)> {
        st.role = Role::Leader;
        st.leader_id = Some(self.id.clone());
        st.candidate = None;
        st.leader_since = Some(now);
        st.last_heartbeat = Some(Utc::now());
        st.open_targets.clear();
        let next_index = st.log.last_index() + 1;
        st.progress = self
            .peers
            .iter()
            .map(|p| {
                (
                    p.clone(),
                    PeerProgress {
                        next_index,
                        match_index: 0,
                        last_ack: None,
                        in_flight: false,
                    },
                )
            })
            .collect();
        // a current-term entry lets earlier entries commit
        st.log.append(st.term, Uuid::new_v4(), EntryPayload::Noop);
        info!(node = %self.id, term = st.term, last_index = st.log.last_index(), "Elected leader");
        self.advance_commit(st);
        self.build_appends(st, now)
    }

    fn become_follower(&self, st: &mut RaftState, term: u64, leader: Option<NodeId>, now: Instant) {
        if term > st.term {
            st.term = term;
            st.voted_for = None;
        }
        if st.role == Role::Leader {
            info!(node = %self.id, term = st.term, "Stepping down to follower");
        }
        st.role = Role::Follower;
        st.candidate = None;
        st.leader_id = leader;
        st.leader_since = None;
        st.progress.clear();
        st.open_targets.clear();
        st.election.reset(now);
    }

    fn build_appends(&self, st: &mut RaftState, now: Instant) -> Vec<(NodeId, Message)> {
        st.last_broadcast = Some(now);
        st.last_heartbeat = Some(Utc::now());
        let mut out = Vec::new();
        for (peer, progress) in st.progress.iter_mut() {
            if progress.in_flight {
                continue;
            }
            progress.in_flight = true;
            if progress.next_index <= st.log.snapshot_index() {
                // what this peer needs was compacted away
                debug!(node = %self.id, peer = %peer, snapshot_index = st.log.snapshot_index(), "Sending snapshot");
                out.push((
                    peer.clone(),
                    Message::InstallSnapshot(InstallSnapshot {
                        term: st.term,
                        leader_id: self.id.clone(),
                        last_included_index: st.log.snapshot_index(),
                        last_included_term: st.log.snapshot_term(),
                        applied_keys: st.applied_keys.entries(),
                    }),
                ));
                continue;
            }
            let prev_log_index = progress.next_index - 1;
            let mut entries = st.log.entries_from(progress.next_index);
            entries.truncate(MAX_BATCH);
            out.push((
                peer.clone(),
                Message::AppendEntries(AppendEntries {
                    term: st.term,
                    leader_id: self.id.clone(),
                    prev_log_index,
                    prev_log_term: st.log.term_at(prev_log_index).unwrap_or(0),
                    entries,
                    leader_commit: st.log.commit_index(),
                }),
            ));
        }
        out
    }

    fn dispatch(&self, outbound: Outbound) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        match outbound {
            Outbound::Nothing => {}
            Outbound::Votes(request) => {
                for peer in self.peers.clone() {
                    let me = Arc::clone(&me);
                    let request = request.clone();
                    tokio::spawn(async move {
                        let term = request.term;
                        let sent = send_with_retry(&me.transport, &peer, Message::RequestVote(request), me.retry_policy()).await;
                        match sent {
                            Ok(Reply::Vote(reply)) => me.on_vote_reply(&peer, term, reply),
                            Ok(other) => warn!(peer = %peer, reply = ?other, "Unexpected reply to RequestVote"),
                            Err(e) => debug!(peer = %peer, error = %e, "RequestVote failed"),
                        }
                    });
                }
            }
            Outbound::Appends(requests) => {
                for (peer, request) in requests {
                    let term = match &request {
                        Message::AppendEntries(a) => a.term,
                        Message::InstallSnapshot(s) => s.term,
                        _ => continue,
                    };
                    let me = Arc::clone(&me);
                    tokio::spawn(async move {
                        let kind = request.kind();
                        let sent = send_with_retry(&me.transport, &peer, request, me.append_policy()).await;
                        let reply = match sent {
                            Ok(Reply::Append(reply)) => Some(reply),
                            Ok(other) => {
                                warn!(peer = %peer, kind, reply = ?other, "Unexpected reply to replication message");
                                None
                            }
                            Err(e) => {
                                debug!(peer = %peer, kind, error = %e, "Replication message failed");
                                None
                            }
                        };
                        me.on_append_reply(&peer, term, reply);
                    });
                }
            }
        }
    }

    // ========================================================================
    // Replies
    // ========================================================================

    fn on_vote_reply(&self, peer: &str, term_sent: u64, reply: VoteReply) {
        let now = Instant::now();
        let mut persist = false;
        let outbound = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if reply.term > st.term {
                debug!(node = %self.id, peer = %peer, term = reply.term, "Higher term in vote reply");
                self.become_follower(st, reply.term, None, now);
                persist = true;
                Outbound::Nothing
            } else if st.role != Role::Candidate || st.term != term_sent {
                Outbound::Nothing
            } else {
                let quorum = self.quorum();
                let won = st.candidate.as_mut().is_some_and(|c| {
                    c.record_vote(peer, reply.granted);
                    c.quorum_reached(quorum)
                });
                if won {
                    persist = true;
                    Outbound::Appends(self.become_leader(st, now))
                } else {
                    Outbound::Nothing
                }
            }
        };
        if persist {
            self.persist();
        }
        self.dispatch(outbound);
    }

    fn on_append_reply(&self, peer: &str, term_sent: u64, reply: Option<AppendReply>) {
        let now = Instant::now();
        let mut persist = false;
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if let Some(progress) = st.progress.get_mut(peer) {
                progress.in_flight = false;
            }
            let Some(reply) = reply else {
                return;
            };
            if reply.term > st.term {
                debug!(node = %self.id, peer = %peer, term = reply.term, "Higher term in append reply");
                self.become_follower(st, reply.term, None, now);
                persist = true;
            } else if st.role == Role::Leader && st.term == term_sent {
                if let Some(progress) = st.progress.get_mut(peer) {
                    progress.last_ack = Some(now);
                    if reply.success {
                        progress.match_index = progress.match_index.max(reply.match_index);
                        progress.next_index = progress.match_index + 1;
                    } else {
                        progress.next_index = progress
                            .next_index
                            .saturating_sub(1)
                            .min(reply.last_log_index + 1)
                            .max(1);
                    }
                }
                if reply.success {
                    persist = self.advance_commit(st);
                }
            }
        }
        if persist {
            self.persist();
        }
    }

    /// Commit the highest current-term index replicated on a majority.
    fn advance_commit(&self, st: &mut RaftState) -> bool {
        let quorum = self.quorum();
        let mut advanced = false;
        let mut n = st.log.last_index();
        while n > st.log.commit_index() {
            if st.log.term_at(n) != Some(st.term) {
                // earlier-term entries only commit through a later one
                break;
            }
            let acks = 1 + st.progress.values().filter(|p| p.match_index >= n).count();
            if acks >= quorum {
                advanced = st.log.commit_to(n);
                debug!(node = %self.id, commit_index = n, "Commit index advanced");
                break;
            }
            n -= 1;
        }
        self.apply_committed(st) || advanced
    }

    /// Emit committed entries in log order, each idempotency key at most once,
    /// then fold the applied prefix into the snapshot once it grows past the
    /// compaction threshold.
    fn apply_committed(&self, st: &mut RaftState) -> bool {
        let mut applied_any = false;
        while st.applied_index < st.log.commit_index() {
            let Some(entry) = st.log.entry(st.applied_index + 1).cloned() else {
                break;
            };
            st.applied_index = entry.index;
            applied_any = true;
            if matches!(entry.payload, EntryPayload::Noop) {
                continue;
            }
            if !st.applied_keys.insert(entry.key, entry.index) {
                debug!(node = %self.id, index = entry.index, key = %entry.key, "Key already applied, skipping");
                continue;
            }
            debug!(node = %self.id, index = entry.index, key = %entry.key, "Applying committed entry");
            let _ = self.applied_tx.send(CommittedEntry {
                index: entry.index,
                term: entry.term,
                payload: entry.payload,
            });
        }
        if st.applied_index.saturating_sub(st.log.snapshot_index()) >= self.config.log_compaction_threshold {
            let dropped = st.log.compact_to(st.applied_index);
            debug!(
                node = %self.id,
                snapshot_index = st.log.snapshot_index(),
                dropped,
                "Compacted applied log prefix"
            );
        }
        applied_any
    }

    // ========================================================================
    // Inbound RPCs
    // ========================================================================

    fn handle_request_vote(&self, request: RequestVote) -> VoteReply {
        let now = Instant::now();
        let mut changed = false;
        let reply = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if request.term > st.term {
                self.become_follower(st, request.term, None, now);
                changed = true;
            }
            let free = st
                .voted_for
                .as_deref()
                .map_or(true, |v| v == request.candidate_id);
            let granted = request.term == st.term
                && free
                && st.log.is_up_to_date(request.last_log_term, request.last_log_index);
            if granted {
                changed |= st.voted_for.is_none();
                st.voted_for = Some(request.candidate_id.clone());
                st.election.reset(now);
                debug!(node = %self.id, candidate = %request.candidate_id, term = st.term, "Vote granted");
            } else if request.term < st.term {
                debug!(node = %self.id, seen = request.term, current = st.term, "Stale RequestVote dropped");
            }
            VoteReply { term: st.term, granted }
        };
        if changed {
            self.persist();
        }
        reply
    }

    fn handle_append_entries(&self, request: AppendEntries) -> AppendReply {
        let now = Instant::now();
        let mut changed = false;
        let reply = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if request.term < st.term {
                debug!(node = %self.id, seen = request.term, current = st.term, "Stale AppendEntries dropped");
                return AppendReply {
                    term: st.term,
                    success: false,
                    match_index: 0,
                    last_log_index: st.log.last_index(),
                };
            }
            if request.term > st.term
                || st.role != Role::Follower
                || st.leader_id.as_deref() != Some(request.leader_id.as_str())
            {
                changed |= request.term > st.term;
                self.become_follower(st, request.term, Some(request.leader_id.clone()), now);
            } else {
                st.election.reset(now);
            }
            st.last_heartbeat = Some(Utc::now());
            st.last_leader_contact = Some(now);

            let success = st.log.try_append(request.prev_log_index, request.prev_log_term, &request.entries);
            let mut match_index = 0;
            if success {
                match_index = request.prev_log_index + request.entries.len() as u64;
                changed |= !request.entries.is_empty();
                if st.log.commit_to(request.leader_commit.min(match_index)) {
                    changed |= self.apply_committed(st);
                }
            } else {
                debug!(
                    node = %self.id,
                    prev_index = request.prev_log_index,
                    prev_term = request.prev_log_term,
                    "Log consistency check failed"
                );
            }
            AppendReply {
                term: st.term,
                success,
                match_index,
                last_log_index: st.log.last_index(),
            }
        };
        if changed {
            self.persist();
        }
        reply
    }

    /// Leader-to-follower snapshot. Retained entries the snapshot covers are
    /// applied first when they agree with it; the rest are dropped.
    fn handle_install_snapshot(&self, request: InstallSnapshot) -> AppendReply {
        let now = Instant::now();
        let reply = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if request.term < st.term {
                debug!(node = %self.id, seen = request.term, current = st.term, "Stale InstallSnapshot dropped");
                return AppendReply {
                    term: st.term,
                    success: false,
                    match_index: 0,
                    last_log_index: st.log.last_index(),
                };
            }
            if request.term > st.term
                || st.role != Role::Follower
                || st.leader_id.as_deref() != Some(request.leader_id.as_str())
            {
                self.become_follower(st, request.term, Some(request.leader_id.clone()), now);
            } else {
                st.election.reset(now);
            }
            st.last_heartbeat = Some(Utc::now());
            st.last_leader_contact = Some(now);

            let index = request.last_included_index;
            if index > st.log.snapshot_index() {
                if st.log.term_at(index) == Some(request.last_included_term) && st.log.commit_to(index) {
                    self.apply_committed(st);
                }
                st.log.install_snapshot(index, request.last_included_term);
                for (key, position) in request.applied_keys {
                    st.applied_keys.insert(key, position);
                }
                st.applied_index = st.applied_index.max(index);
                info!(node = %self.id, snapshot_index = index, term = request.last_included_term, "Snapshot installed");
            }
            AppendReply {
                term: st.term,
                success: true,
                match_index: index,
                last_log_index: st.log.last_index(),
            }
        };
        self.persist();
        reply
    }

    fn handle_forward(&self, from: &str, forward: Forward) -> ForwardReply {
        debug!(node = %self.id, from = %from, key = ?forward.payload.key(), "Forwarded commit request");
        match self.propose_local(forward.payload) {
            Ok(index) => ForwardReply::Accepted { index },
            Err(ConsensusError::TargetPending(target)) => ForwardReply::TargetPending { target },
            Err(ConsensusError::NotLeader { leader_hint }) => ForwardReply::NotLeader { leader_hint },
            Err(e) => ForwardReply::Rejected(e.to_string()),
        }
    }

    // ========================================================================
    // Commit path
    // ========================================================================

    /// Submit an action for replication.
    ///
    /// On the leader it is appended locally; a follower forwards it to the
    /// known leader. Re-proposing an action id already in the log, or still in
    /// the applied-key window, returns the existing index.
    pub async fn propose(&self, action: RecoveryAction) -> Result<u64, ConsensusError> {
        self.submit(EntryPayload::Action(action)).await
    }

    /// Submit a governance op for replication; same path as `propose`.
    pub async fn propose_governance(&self, op: GovernanceOp) -> Result<u64, ConsensusError> {
        self.submit(EntryPayload::Governance(op)).await
    }

    async fn submit(&self, payload: EntryPayload) -> Result<u64, ConsensusError> {
        let leader = {
            let st = self.lock();
            match (st.role, st.leader_id.clone()) {
                (Role::Leader, _) => None,
                (_, Some(leader)) => Some(leader),
                (_, None) => return Err(ConsensusError::NoLeader),
            }
        };
        let Some(leader) = leader else {
            return self.propose_local(payload);
        };

        let reply = send_with_retry(&self.transport, &leader, Message::Forward(Forward { payload }), self.retry_policy()).await?;
        match reply {
            Reply::Forward(ForwardReply::Accepted { index }) => Ok(index),
            Reply::Forward(ForwardReply::NotLeader { leader_hint }) => Err(ConsensusError::NotLeader { leader_hint }),
            Reply::Forward(ForwardReply::TargetPending { target }) => Err(ConsensusError::TargetPending(target)),
            Reply::Forward(ForwardReply::Rejected(reason)) => Err(ConsensusError::Rejected { by: leader, reason }),
            other => Err(ConsensusError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    fn propose_local(&self, payload: EntryPayload) -> Result<u64, ConsensusError> {
        let now = Instant::now();
        let (index, outbound) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.role != Role::Leader {
                return Err(ConsensusError::NotLeader {
                    leader_hint: st.leader_id.clone(),
                });
            }
            let Some(key) = payload.key() else {
                return Err(ConsensusError::Invalid("noop entries are appended by the leader only".into()));
            };
            if let Some(index) = st.log.position_of(&key).or_else(|| st.applied_keys.position(&key)) {
                debug!(node = %self.id, key = %key, index, "Duplicate proposal, returning existing entry");
                return Ok(index);
            }
            let index = match payload {
                EntryPayload::Action(mut action) => {
                    if let Some(open) = st.open_targets.get(&action.target_node) {
                        if *open != action.id {
                            return Err(ConsensusError::TargetPending(action.target_node.clone()));
                        }
                    }
                    action.assigned_executor = Some(self.id.clone());
                    let target = action.target_node.clone();
                    let index = st.log.append(st.term, key, EntryPayload::Action(action));
                    st.open_targets.insert(target.clone(), key);
                    info!(node = %self.id, term = st.term, index, action = %key, target = %target, "Action appended");
                    index
                }
                other => {
                    let index = st.log.append(st.term, key, other);
                    debug!(node = %self.id, term = st.term, index, key = %key, "Governance op appended");
                    index
                }
            };
            self.advance_commit(st);
            (index, self.build_appends(st, now))
        };
        self.persist();
        self.dispatch(Outbound::Appends(outbound));
        Ok(index)
    }

    /// Execution fence: the caller must still lead in the term the entry was
    /// appended in.
    pub fn ensure_leader_for(&self, entry_term: u64) -> Result<(), ConsensusError> {
        let st = self.lock();
        if st.role != Role::Leader {
            return Err(ConsensusError::NotLeader {
                leader_hint: st.leader_id.clone(),
            });
        }
        if st.term != entry_term {
            return Err(ConsensusError::StaleTerm {
                seen: entry_term,
                current: st.term,
            });
        }
        Ok(())
    }

    /// Let a new action for `target` be proposed again.
    pub fn release_target(&self, target: &str, action_id: Uuid) {
        let mut st = self.lock();
        if st.open_targets.get(target) == Some(&action_id) {
            st.open_targets.remove(target);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_leader(&self) -> bool {
        self.lock().role == Role::Leader
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.lock().leader_id.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.lock().term
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    /// True if this node leads, or heard from a leader within `window`.
    pub fn has_live_leader(&self, window: Duration) -> bool {
        let st = self.lock();
        match st.role {
            Role::Leader => true,
            _ => st.leader_id.is_some() && st.last_leader_contact.is_some_and(|t| t.elapsed() < window),
        }
    }

    pub fn node_state(&self) -> NodeState {
        let st = self.lock();
        NodeState {
            id: self.id.clone(),
            role: st.role,
            last_heartbeat: st.last_heartbeat,
        }
    }

    pub fn status(&self) -> ConsensusStatus {
        let st = self.lock();
        ConsensusStatus {
            node_id: self.id.clone(),
            role: st.role,
            term: st.term,
            leader_id: st.leader_id.clone(),
            commit_index: st.log.commit_index(),
            last_log_index: st.log.last_index(),
            applied_index: st.applied_index,
            snapshot_index: st.log.snapshot_index(),
            applied_keys: st.applied_keys.len(),
            last_heartbeat: st.last_heartbeat,
        }
    }

    /// Committed entries still retained after the snapshot, in order.
    pub fn committed_entries(&self) -> Vec<LogEntry> {
        let st = self.lock();
        let commit = st.log.commit_index();
        st.log
            .entries()
            .iter()
            .take_while(|e| e.index <= commit)
            .cloned()
            .collect()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn save_state(&self) -> Result<(), ConsensusError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = {
            let st = self.lock();
            PersistedConsensus {
                term: st.term,
                voted_for: st.voted_for.clone(),
                snapshot_index: st.log.snapshot_index(),
                snapshot_term: st.log.snapshot_term(),
                log: st.log.entries().to_vec(),
                commit_index: st.log.commit_index(),
                applied_keys: st.applied_keys.entries(),
            }
        };
        store.save_consensus(&snapshot)?;
        Ok(())
    }

    /// Restore term, vote, snapshot point and log. Committed entries after the
    /// snapshot whose keys were not yet applied are re-emitted; applied keys
    /// are not. Returns whether any state was found.
    pub fn load_state(&self) -> Result<bool, ConsensusError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(saved) = store.load_consensus()? else {
            return Ok(false);
        };
        let mut guard = self.lock();
        let st = &mut *guard;
        st.term = saved.term;
        st.voted_for = saved.voted_for;
        st.log = ReplicatedLog::restore(saved.snapshot_index, saved.snapshot_term, saved.log, saved.commit_index);
        st.applied_keys = RecentKeys::from_entries(self.config.applied_key_window, saved.applied_keys);
        st.applied_index = saved.snapshot_index;
        self.apply_committed(st);
        info!(
            node = %self.id,
            term = st.term,
            snapshot_index = st.log.snapshot_index(),
            last_index = st.log.last_index(),
            commit_index = st.log.commit_index(),
            "Consensus state restored"
        );
        Ok(true)
    }

    fn persist(&self) {
        if let Err(e) = self.save_state() {
            warn!(node = %self.id, error = %e, "Failed to persist consensus state");
        }
    }
}

#[async_trait]
impl MessageHandler for ConsensusCoordinator {
    async fn handle(&self, from: &str, message: Message) -> Reply {
        match message {
            Message::RequestVote(request) => Reply::Vote(self.handle_request_vote(request)),
            Message::AppendEntries(request) => Reply::Append(self.handle_append_entries(request)),
            Message::InstallSnapshot(request) => Reply::Append(self.handle_install_snapshot(request)),
            Message::Forward(forward) => Reply::Forward(self.handle_forward(from, forward)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStateStore;
    use crate::transport::LocalNetwork;
    use crate::types::{ActionOrigin, ActionType, IssueKind};

    fn config() -> ConsensusConfig {
        ConsensusConfig::default()
    }

    fn action(target: &str) -> RecoveryAction {
        RecoveryAction::new(ActionType::RestartService, target, IssueKind::HighCpu, ActionOrigin::AutoExecute)
    }

    async fn drive_until<F: Fn() -> bool>(nodes: &[Arc<ConsensusCoordinator>], deadline: Duration, done: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            for n in nodes {
                n.tick().await;
            }
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let net = LocalNetwork::seeded(1);
        let node = ConsensusCoordinator::new("n1", &[], config(), Arc::new(net.endpoint("n1")), None);
        let mut rx = node.take_applied_receiver().unwrap();
        assert!(node.take_applied_receiver().is_none());

        assert!(drive_until(&[Arc::clone(&node)], Duration::from_secs(2), || node.is_leader()).await);
        let a = action("svc");
        let index = node.propose(a.clone()).await.unwrap();
        // duplicate key is a no-op returning the same position
        assert_eq!(node.propose(a.clone()).await.unwrap(), index);

        let committed = rx.recv().await.unwrap();
        let applied = committed.action().unwrap();
        assert_eq!(applied.id, a.id);
        assert_eq!(applied.assigned_executor.as_deref(), Some("n1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_target_rejects_second_action() {
        let net = LocalNetwork::seeded(2);
        let node = ConsensusCoordinator::new("n1", &[], config(), Arc::new(net.endpoint("n1")), None);
        assert!(drive_until(&[Arc::clone(&node)], Duration::from_secs(2), || node.is_leader()).await);

        let first = action("db");
        node.propose(first.clone()).await.unwrap();
        assert!(matches!(node.propose(action("db")).await, Err(ConsensusError::TargetPending(_))));
        node.release_target("db", first.id);
        assert!(node.propose(action("db")).await.is_ok());
    }

    #[tokio::test]
    async fn test_follower_without_leader_reports_no_leader() {
        let net = LocalNetwork::seeded(3);
        let node = ConsensusCoordinator::new("n1", &["n2".into(), "n3".into()], config(), Arc::new(net.endpoint("n1")), None);
        assert!(matches!(node.propose(action("x")).await, Err(ConsensusError::NoLeader)));
        assert!(!node.has_live_leader(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_vote_rules() {
        let net = LocalNetwork::seeded(4);
        let node = ConsensusCoordinator::new("n1", &["n2".into(), "n3".into()], config(), Arc::new(net.endpoint("n1")), None);

        let ask = |candidate: &str, term: u64| RequestVote {
            term,
            candidate_id: candidate.into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(node.handle_request_vote(ask("n2", 1)).granted);
        // one vote per term
        assert!(!node.handle_request_vote(ask("n3", 1)).granted);
        assert!(node.handle_request_vote(ask("n2", 1)).granted);
        // stale term
        let stale = node.handle_request_vote(ask("n3", 0));
        assert!(!stale.granted);
        assert_eq!(stale.term, 1);
        // higher term resets the vote
        assert!(node.handle_request_vote(ask("n3", 2)).granted);
        assert_eq!(node.current_term(), 2);
    }

    #[tokio::test]
    async fn test_restart_resumes_term_and_skips_applied_keys() {
        let net = LocalNetwork::seeded(5);
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let a = action("svc");
        let term = {
            let node = ConsensusCoordinator::new("n1", &[], config(), Arc::new(net.endpoint("n1")), Some(Arc::clone(&store)));
            let mut rx = node.take_applied_receiver().unwrap();
            assert!(drive_until(&[Arc::clone(&node)], Duration::from_secs(2), || node.is_leader()).await);
            node.propose(a.clone()).await.unwrap();
            assert_eq!(rx.recv().await.unwrap().action().map(|c| c.id), Some(a.id));
            node.current_term()
        };

        let restarted = ConsensusCoordinator::new("n1", &[], config(), Arc::new(net.endpoint("n1")), Some(store));
        assert_eq!(restarted.current_term(), term);
        let mut rx = restarted.take_applied_receiver().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(drive_until(&[Arc::clone(&restarted)], Duration::from_secs(2), || restarted.is_leader()).await);
        assert!(restarted.current_term() > term);
        assert_eq!(restarted.propose(a.clone()).await.unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_log_and_applied_keys_stay_bounded() {
        let net = LocalNetwork::seeded(6);
        let store = Arc::new(InMemoryStateStore::new());
        let cfg = ConsensusConfig {
            log_compaction_threshold: 16,
            applied_key_window: 32,
            ..config()
        };
        let node = ConsensusCoordinator::new("n1", &[], cfg, Arc::new(net.endpoint("n1")), Some(store.clone() as Arc<dyn StateStore>));
        let mut rx = node.take_applied_receiver().unwrap();
        assert!(drive_until(&[Arc::clone(&node)], Duration::from_secs(2), || node.is_leader()).await);

        let mut proposed = Vec::new();
        for _ in 0..200 {
            let a = action("svc");
            node.propose(a.clone()).await.unwrap();
            node.release_target("svc", a.id);
            proposed.push(a);
        }
        let mut applied = 0;
        while rx.try_recv().is_ok() {
            applied += 1;
        }
        assert_eq!(applied, 200);

        let status = node.status();
        assert_eq!(status.last_log_index, 201);
        assert!(status.snapshot_index >= 201 - 16);
        assert!(node.committed_entries().len() < 16);
        assert!(status.applied_keys <= 32);

        let saved = store.load_consensus().unwrap().unwrap();
        assert!(saved.log.len() < 16);
        assert!(saved.applied_keys.len() <= 32);
        assert_eq!(saved.snapshot_index, status.snapshot_index);

        // index 185 is compacted away but its key is still in the window
        let compacted = proposed[183].clone();
        assert!(status.snapshot_index >= 185);
        assert_eq!(node.propose(compacted).await.unwrap(), 185);
        assert_eq!(node.status().last_log_index, 201);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarded_noop_is_rejected_with_reason() {
        let net = LocalNetwork::seeded(7);
        let node = ConsensusCoordinator::new("n1", &[], config(), Arc::new(net.endpoint("n1")), None);
        assert!(drive_until(&[Arc::clone(&node)], Duration::from_secs(2), || node.is_leader()).await);

        let reply = node.handle_forward("n2", Forward { payload: EntryPayload::Noop });
        assert!(matches!(reply, ForwardReply::Rejected(reason) if reason.contains("noop")));
    }

    struct RefusingLeader;

    #[async_trait]
    impl MessageHandler for RefusingLeader {
        async fn handle(&self, _from: &str, _message: Message) -> Reply {
            Reply::Forward(ForwardReply::Rejected("target is quarantined".into()))
        }
    }

    #[tokio::test]
    async fn test_follower_surfaces_leader_rejection() {
        let net = LocalNetwork::seeded(8);
        net.on_receive("n2", Arc::new(RefusingLeader));
        let node = ConsensusCoordinator::new("n1", &["n2".into()], config(), Arc::new(net.endpoint("n1")), None);
        let heartbeat = node.handle_append_entries(AppendEntries {
            term: 1,
            leader_id: "n2".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(heartbeat.success);

        match node.propose(action("svc")).await {
            Err(ConsensusError::Rejected { by, reason }) => {
                assert_eq!(by, "n2");
                assert_eq!(reason, "target is quarantined");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
