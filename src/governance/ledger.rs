use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ops::GovernanceOp;
use super::proposal::{Proposal, ProposalKind, ProposalStatus, ProposalSummary, Verdict};
use super::voting::{voting_power, Vote, VoteChoice, VoterRegistry};
use super::GovernanceError;

/// Result of a successful `cast_vote`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteReceipt {
    pub voting_power: u64,
    pub recorded: bool,
    /// The voter already had a ballot, which this one replaced
    pub replaced: bool,
    /// Proposal status right after the vote was applied
    pub status: ProposalStatus,
}

/// One proposal plus its resolution signal.
///
/// The mutex makes vote application single-writer per proposal; it is never
/// held across an await.
struct ProposalSlot {
    proposal: Mutex<Proposal>,
    status_tx: watch::Sender<ProposalStatus>,
}

impl ProposalSlot {
    fn snapshot(&self) -> Result<Proposal, GovernanceError> {
        self.proposal
            .lock()
            .map(|p| p.clone())
            .map_err(|_| GovernanceError::Poisoned)
    }
}

/// Quadratic-voting ledger with TTL eviction of resolved proposals.
pub struct GovernanceLedger {
    proposals: DashMap<Uuid, Arc<ProposalSlot>>,
    voters: RwLock<VoterRegistry>,
    retention: Duration,
    /// Woken whenever a proposal is inserted
    opened: Notify,
}

impl GovernanceLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            proposals: DashMap::new(),
            voters: RwLock::new(VoterRegistry::default()),
            retention,
            opened: Notify::new(),
        }
    }

    /// Register (or re-balance) a voter.
    pub fn register_voter(&self, voter_id: &str, balance: u64) -> Result<(), GovernanceError> {
        if voter_id.trim().is_empty() {
            return Err(GovernanceError::Validation("voter_id must not be empty".into()));
        }
        let mut voters = self.voters.write().map_err(|_| GovernanceError::Poisoned)?;
        voters.register(voter_id, balance);
        Ok(())
    }

    pub fn eligible_power(&self) -> u64 {
        self.voters.read().map(|v| v.eligible_power()).unwrap_or(0)
    }

    /// Open a proposal through the governance API.
    pub fn create_proposal(
        &self,
        title: &str,
        description: &str,
        duration: Duration,
        quorum_fraction: f64,
        pass_threshold: f64,
    ) -> Result<Uuid, GovernanceError> {
        self.create_proposal_of_kind(ProposalKind::Manual, title, description, duration, quorum_fraction, pass_threshold)
    }

    pub fn create_proposal_of_kind(
        &self,
        kind: ProposalKind,
        title: &str,
        description: &str,
        duration: Duration,
        quorum_fraction: f64,
        pass_threshold: f64,
    ) -> Result<Uuid, GovernanceError> {
        let proposal = self.draft_proposal(kind, title, description, duration, quorum_fraction, pass_threshold)?;
        let id = proposal.id;
        self.insert_proposal(proposal);
        Ok(id)
    }

    /// Validate and build an open proposal without recording it.
    pub fn draft_proposal(
        &self,
        kind: ProposalKind,
        title: &str,
        description: &str,
        duration: Duration,
        quorum_fraction: f64,
        pass_threshold: f64,
    ) -> Result<Proposal, GovernanceError> {
        if title.trim().is_empty() {
            return Err(GovernanceError::Validation("title must not be empty".into()));
        }
        if duration.is_zero() {
            return Err(GovernanceError::Validation("duration must be positive".into()));
        }
        if !(0.0..=1.0).contains(&quorum_fraction) {
            return Err(GovernanceError::Validation(format!(
                "quorum_fraction {quorum_fraction} outside [0, 1]"
            )));
        }
        if !(pass_threshold > 0.0 && pass_threshold <= 1.0) {
            return Err(GovernanceError::Validation(format!(
                "pass_threshold {pass_threshold} outside (0, 1]"
            )));
        }
        let lifetime = chrono::Duration::from_std(duration)
            .map_err(|_| GovernanceError::Validation("duration out of range".into()))?;

        let now = Utc::now();
        Ok(Proposal {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: description.to_string(),
            kind,
            created_at: now,
            expires_at: now + lifetime,
            quorum_fraction,
            pass_threshold,
            votes: BTreeMap::new(),
            status: ProposalStatus::Open,
            resolved_at: None,
            failure_reason: None,
        })
    }

    /// Record a drafted proposal. Returns false, changing nothing, if its id
    /// is already known.
    pub fn insert_proposal(&self, proposal: Proposal) -> bool {
        let id = proposal.id;
        let (kind, title) = (proposal.kind, proposal.title.clone());
        let inserted = match self.proposals.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (status_tx, _) = watch::channel(proposal.status);
                slot.insert(Arc::new(ProposalSlot {
                    proposal: Mutex::new(proposal),
                    status_tx,
                }));
                true
            }
        };
        if inserted {
            info!(proposal = %id, kind = ?kind, title = %title, "Proposal opened");
            self.opened.notify_waiters();
        }
        inserted
    }

    pub fn contains(&self, proposal_id: Uuid) -> bool {
        self.proposals.contains_key(&proposal_id)
    }

    /// Wait up to `within` for a proposal to be inserted. Returns whether it is present.
    pub async fn await_present(&self, proposal_id: Uuid, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            // registered before the check so an insert in between is not missed
            let inserted = self.opened.notified();
            if self.contains(proposal_id) {
                return true;
            }
            if tokio::time::timeout_at(deadline, inserted).await.is_err() {
                return self.contains(proposal_id);
            }
        }
    }

    /// Apply one replicated governance change.
    ///
    /// Re-applying an `Open` is a no-op; a `Vote` goes through `cast_vote`,
    /// so it replaces the voter's earlier ballot.
    pub fn apply(&self, op: &GovernanceOp) -> Result<Option<VoteReceipt>, GovernanceError> {
        match op {
            GovernanceOp::Open(proposal) => {
                if !self.insert_proposal(proposal.clone()) {
                    debug!(proposal = %proposal.id, "Proposal already known");
                }
                Ok(None)
            }
            GovernanceOp::Vote {
                proposal_id,
                voter_id,
                choice,
                tokens,
                ..
            } => self.cast_vote(*proposal_id, voter_id, *choice, *tokens).map(Some),
        }
    }

    /// The checks `cast_vote` makes before touching a proposal, without
    /// recording anything.
    pub fn check_ballot(&self, proposal_id: Uuid, voter_id: &str, tokens: u64) -> Result<(), GovernanceError> {
        self.check_voter(voter_id, tokens)?;
        let proposal = self.get(proposal_id)?;
        if proposal.status.is_terminal() {
            return Err(GovernanceError::ProposalClosed {
                id: proposal_id,
                status: proposal.status,
            });
        }
        Ok(())
    }

    fn check_voter(&self, voter_id: &str, tokens: u64) -> Result<(), GovernanceError> {
        if voter_id.trim().is_empty() {
            return Err(GovernanceError::Validation("voter_id must not be empty".into()));
        }
        let balance = self
            .voters
            .read()
            .map_err(|_| GovernanceError::Poisoned)?
            .balance(voter_id)
            .ok_or_else(|| GovernanceError::Validation(format!("voter '{voter_id}' is not registered")))?;
        if tokens > balance {
            return Err(GovernanceError::Validation(format!(
                "voter '{voter_id}' committed {tokens} tokens but holds {balance}"
            )));
        }
        Ok(())
    }

    fn slot(&self, id: Uuid) -> Result<Arc<ProposalSlot>, GovernanceError> {
        self.proposals
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(GovernanceError::NotFound(id))
    }

    /// Apply the verdict (if any) under the slot lock and publish the new status.
    fn settle(&self, slot: &ProposalSlot, proposal: &mut Proposal, now: DateTime<Utc>) {
        if let Verdict::Resolve(status, reason) = proposal.evaluate(self.eligible_power(), now) {
            proposal.resolve(status, reason, now);
            let tally = proposal.tally();
            info!(
                proposal = %proposal.id,
                status = %status,
                yes = tally.yes,
                no = tally.no,
                abstain = tally.abstain,
                "Proposal resolved"
            );
            slot.status_tx.send_replace(status);
        }
    }

    /// Cast or replace a ballot.
    ///
    /// Malformed input is rejected before anything is touched; a vote on a
    /// resolved (or just-expired) proposal returns `ProposalClosed`.
    pub fn cast_vote(
        &self,
        proposal_id: Uuid,
        voter_id: &str,
        choice: VoteChoice,
        tokens: u64,
    ) -> Result<VoteReceipt, GovernanceError> {
        self.check_voter(voter_id, tokens)?;
        let slot = self.slot(proposal_id)?;

        let mut proposal = slot.proposal.lock().map_err(|_| GovernanceError::Poisoned)?;
        let now = Utc::now();
        if !proposal.status.is_terminal() && proposal.is_expired_at(now) {
            self.settle(&slot, &mut proposal, now);
        }
        if proposal.status.is_terminal() {
            debug!(proposal = %proposal_id, voter = %voter_id, "Vote rejected, proposal closed");
            return Err(GovernanceError::ProposalClosed {
                id: proposal_id,
                status: proposal.status,
            });
        }

        let power = voting_power(tokens);
        let replaced = proposal
            .votes
            .insert(
                voter_id.to_string(),
                Vote {
                    voter_id: voter_id.to_string(),
                    tokens,
                    power,
                    choice,
                    cast_at: now,
                },
            )
            .is_some();
        debug!(proposal = %proposal_id, voter = %voter_id, choice = %choice, power, replaced, "Vote recorded");
        self.settle(&slot, &mut proposal, now);

        Ok(VoteReceipt {
            voting_power: power,
            recorded: true,
            replaced,
            status: proposal.status,
        })
    }

    /// Current state of a proposal, resolving it first if it has expired.
    pub fn get(&self, proposal_id: Uuid) -> Result<Proposal, GovernanceError> {
        let slot = self.slot(proposal_id)?;
        let mut proposal = slot.proposal.lock().map_err(|_| GovernanceError::Poisoned)?;
        if !proposal.status.is_terminal() && proposal.is_expired_at(Utc::now()) {
            self.settle(&slot, &mut proposal, Utc::now());
        }
        Ok(proposal.clone())
    }

    /// Wait until the proposal resolves, bounded by its expiry.
    ///
    /// Wakes on the resolution signal or the expiry timer, whichever comes
    /// first; there is no polling.
    pub async fn await_resolution(&self, proposal_id: Uuid) -> Result<Proposal, GovernanceError> {
        let slot = self.slot(proposal_id)?;
        let mut rx = slot.status_tx.subscribe();
        let expires_at = slot.snapshot()?.expires_at;

        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(remaining) => {
                    let mut proposal = slot.proposal.lock().map_err(|_| GovernanceError::Poisoned)?;
                    if !proposal.status.is_terminal() {
                        self.settle(&slot, &mut proposal, Utc::now().max(expires_at));
                    }
                    break;
                }
            }
        }
        slot.snapshot()
    }

    /// Resolve every open proposal past its expiry. Returns how many resolved.
    pub fn resolve_expired(&self) -> usize {
        let now = Utc::now();
        let slots: Vec<Arc<ProposalSlot>> = self.proposals.iter().map(|e| Arc::clone(e.value())).collect();
        let mut resolved = 0;
        for slot in slots {
            let Ok(mut proposal) = slot.proposal.lock() else {
                warn!("Skipping poisoned proposal slot");
                continue;
            };
            if !proposal.status.is_terminal() && proposal.is_expired_at(now) {
                self.settle(&slot, &mut proposal, now);
                resolved += 1;
            }
        }
        resolved
    }

    /// Resolve expired proposals, then evict resolved ones older than the
    /// retention window. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        self.resolve_expired();
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let before = self.proposals.len();
        self.proposals.retain(|_, slot| match slot.proposal.lock() {
            Ok(p) => !matches!(p.resolved_at, Some(at) if at <= cutoff),
            Err(_) => false,
        });
        let evicted = before.saturating_sub(self.proposals.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.proposals.len(), "Governance sweep");
        }
        evicted
    }

    pub fn summaries(&self) -> Vec<ProposalSummary> {
        self.resolve_expired();
        let mut out: Vec<ProposalSummary> = self
            .proposals
            .iter()
            .filter_map(|e| e.value().proposal.lock().ok().map(|p| ProposalSummary::from(&*p)))
            .collect();
        out.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
        out
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }
}
