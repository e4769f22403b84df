use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::voting::{Tally, Vote};
use super::GovernanceError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProposalStatus {
    Open,
    Passed,
    Failed,
    /// Reached expiry without a single unit of power cast
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProposalStatus::Open)
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Open => write!(f, "OPEN"),
            ProposalStatus::Passed => write!(f, "PASSED"),
            ProposalStatus::Failed => write!(f, "FAILED"),
            ProposalStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProposalKind {
    /// Opened by the decision gate for 0.8-0.9 confidence, short expiry
    Emergency,
    /// Opened by the decision gate for 0.6-0.8 confidence, long expiry
    Standard,
    /// Opened through the governance API
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    QuorumNotReached,
    /// Quorum met but yes power fell short of the threshold, or tied exactly with no
    ThresholdNotMet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub kind: ProposalKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub quorum_fraction: f64,
    pub pass_threshold: f64,
    /// One ballot per voter
    pub votes: BTreeMap<String, Vote>,
    pub status: ProposalStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
}

/// Outcome of evaluating a proposal against its rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Verdict {
    Undecided,
    Resolve(ProposalStatus, Option<FailureReason>),
}

impl Proposal {
    pub fn tally(&self) -> Tally {
        Tally::from_votes(self.votes.values())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn quorum_met(&self, tally: &Tally, eligible: u64) -> bool {
        eligible > 0 && tally.cast() as f64 / eligible as f64 >= self.quorum_fraction
    }

    /// Pass condition on the current tally. An exact yes/no tie never passes.
    fn passes(&self, tally: &Tally, eligible: u64) -> bool {
        let cast = tally.cast();
        cast > 0
            && tally.yes != tally.no
            && tally.yes as f64 / cast as f64 >= self.pass_threshold
            && self.quorum_met(tally, eligible)
    }

    /// Decide the proposal if its outcome is settled.
    ///
    /// Before expiry only a pass can be settled early: quorum is met, yes power
    /// already clears `pass_threshold` of the whole electorate (so no further
    /// turnout can dilute the ratio below it), and the yes/no gap is wider than
    /// the outstanding power, so no later ballot can produce a tie. At expiry
    /// the current tally decides.
    pub(super) fn evaluate(&self, eligible: u64, now: DateTime<Utc>) -> Verdict {
        if self.status.is_terminal() {
            return Verdict::Undecided;
        }
        let tally = self.tally();

        if self.is_expired_at(now) {
            return if tally.cast() == 0 {
                Verdict::Resolve(ProposalStatus::Expired, None)
            } else if self.passes(&tally, eligible) {
                Verdict::Resolve(ProposalStatus::Passed, None)
            } else if !self.quorum_met(&tally, eligible) {
                Verdict::Resolve(ProposalStatus::Failed, Some(FailureReason::QuorumNotReached))
            } else {
                Verdict::Resolve(ProposalStatus::Failed, Some(FailureReason::ThresholdNotMet))
            };
        }

        let outstanding = eligible.saturating_sub(tally.cast());
        let settled_yes = tally.yes as f64 >= self.pass_threshold * eligible as f64
            && tally.yes.abs_diff(tally.no) > outstanding;
        if settled_yes && self.passes(&tally, eligible) {
            Verdict::Resolve(ProposalStatus::Passed, None)
        } else {
            Verdict::Undecided
        }
    }

    /// `Ok` for a passed proposal, otherwise the error describing why it did not pass.
    pub fn outcome(&self) -> Result<(), GovernanceError> {
        match (self.status, self.failure_reason) {
            (ProposalStatus::Passed, _) => Ok(()),
            (ProposalStatus::Open, _) => Err(GovernanceError::Validation(format!("proposal {} is still open", self.id))),
            (ProposalStatus::Expired, _) => Err(GovernanceError::Expired(self.id)),
            (ProposalStatus::Failed, Some(FailureReason::QuorumNotReached)) => {
                Err(GovernanceError::QuorumNotReached(self.id))
            }
            (ProposalStatus::Failed, _) => Err(GovernanceError::Rejected(self.id)),
        }
    }

    pub(super) fn resolve(&mut self, status: ProposalStatus, reason: Option<FailureReason>, at: DateTime<Utc>) {
        self.status = status;
        self.failure_reason = reason;
        self.resolved_at = Some(at);
    }
}

/// Compact view for the status surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalSummary {
    pub id: Uuid,
    pub title: String,
    pub kind: ProposalKind,
    pub status: ProposalStatus,
    pub tally: Tally,
    pub voters: usize,
    pub expires_at: DateTime<Utc>,
}

impl From<&Proposal> for ProposalSummary {
    fn from(p: &Proposal) -> Self {
        Self {
            id: p.id,
            title: p.title.clone(),
            kind: p.kind,
            status: p.status,
            tally: p.tally(),
            voters: p.votes.len(),
            expires_at: p.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::voting::{voting_power, VoteChoice};

    fn proposal(quorum: f64, threshold: f64, expires_in: chrono::Duration) -> Proposal {
        let now = Utc::now();
        Proposal {
            id: Uuid::new_v4(),
            title: "restart".into(),
            description: String::new(),
            kind: ProposalKind::Manual,
            created_at: now,
            expires_at: now + expires_in,
            quorum_fraction: quorum,
            pass_threshold: threshold,
            votes: BTreeMap::new(),
            status: ProposalStatus::Open,
            resolved_at: None,
            failure_reason: None,
        }
    }

    fn vote(p: &mut Proposal, voter: &str, choice: VoteChoice, tokens: u64) {
        p.votes.insert(
            voter.into(),
            Vote {
                voter_id: voter.into(),
                tokens,
                power: voting_power(tokens),
                choice,
                cast_at: Utc::now(),
            },
        );
    }

    #[test]
    fn test_exact_tie_fails_closed_at_expiry() {
        let mut p = proposal(0.5, 0.5, chrono::Duration::zero());
        vote(&mut p, "a", VoteChoice::Yes, 100);
        vote(&mut p, "b", VoteChoice::No, 100);
        // yes ratio is exactly 0.5 >= threshold, but the tie must not pass
        assert_eq!(
            p.evaluate(20, Utc::now()),
            Verdict::Resolve(ProposalStatus::Failed, Some(FailureReason::ThresholdNotMet))
        );
    }

    #[test]
    fn test_low_threshold_passes_with_more_no_than_yes() {
        // 2 yes, 3 no at 10 power each: 20/50 = 0.4 meets a 0.4 threshold
        let mut p = proposal(0.5, 0.4, chrono::Duration::zero());
        for (voter, choice) in [("a", VoteChoice::Yes), ("b", VoteChoice::Yes), ("c", VoteChoice::No), ("d", VoteChoice::No), ("e", VoteChoice::No)] {
            vote(&mut p, voter, choice, 100);
        }
        assert_eq!(p.evaluate(50, Utc::now()), Verdict::Resolve(ProposalStatus::Passed, None));
    }

    #[test]
    fn test_early_pass_waits_while_a_tie_is_reachable() {
        let mut p = proposal(0.5, 0.4, chrono::Duration::hours(1));
        vote(&mut p, "a", VoteChoice::Yes, 100);
        vote(&mut p, "b", VoteChoice::Yes, 100);
        vote(&mut p, "c", VoteChoice::No, 100);
        // yes 20 of 40 eligible clears 0.4, but the last 10 could tie 20-20
        assert_eq!(p.evaluate(40, Utc::now()), Verdict::Undecided);
        vote(&mut p, "d", VoteChoice::Abstain, 100);
        assert_eq!(p.evaluate(40, Utc::now()), Verdict::Resolve(ProposalStatus::Passed, None));
    }

    #[test]
    fn test_no_votes_expires() {
        let p = proposal(0.5, 0.5, chrono::Duration::zero());
        assert_eq!(p.evaluate(30, Utc::now()), Verdict::Resolve(ProposalStatus::Expired, None));
    }

    #[test]
    fn test_low_turnout_fails_on_quorum() {
        let mut p = proposal(0.5, 0.5, chrono::Duration::zero());
        vote(&mut p, "a", VoteChoice::Yes, 100);
        assert_eq!(
            p.evaluate(30, Utc::now()),
            Verdict::Resolve(ProposalStatus::Failed, Some(FailureReason::QuorumNotReached))
        );
    }

    #[test]
    fn test_early_pass_requires_settled_majority() {
        let mut p = proposal(0.33, 0.5, chrono::Duration::hours(1));
        vote(&mut p, "a", VoteChoice::Yes, 100);
        // 10 of 30: outstanding 20 could still outvote
        assert_eq!(p.evaluate(30, Utc::now()), Verdict::Undecided);
        vote(&mut p, "b", VoteChoice::Yes, 100);
        assert_eq!(p.evaluate(30, Utc::now()), Verdict::Resolve(ProposalStatus::Passed, None));
    }

    #[test]
    fn test_failure_is_never_decided_early() {
        let mut p = proposal(0.33, 0.5, chrono::Duration::hours(1));
        vote(&mut p, "a", VoteChoice::No, 100);
        vote(&mut p, "b", VoteChoice::No, 100);
        assert_eq!(p.evaluate(30, Utc::now()), Verdict::Undecided);
    }
}
