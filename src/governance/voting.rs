//! Quadratic voting primitives

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Voting power bought by `tokens`: `floor(sqrt(tokens))`, computed exactly.
pub fn voting_power(tokens: u64) -> u64 {
    // f64 sqrt is within one of the true root for every u64; correct the edge.
    let mut root = (tokens as f64).sqrt() as u64;
    while u128::from(root) * u128::from(root) > u128::from(tokens) {
        root -= 1;
    }
    while u128::from(root + 1) * u128::from(root + 1) <= u128::from(tokens) {
        root += 1;
    }
    root
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

impl std::fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteChoice::Yes => write!(f, "YES"),
            VoteChoice::No => write!(f, "NO"),
            VoteChoice::Abstain => write!(f, "ABSTAIN"),
        }
    }
}

/// One voter's current ballot on a proposal. Re-voting replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub voter_id: String,
    pub tokens: u64,
    pub power: u64,
    pub choice: VoteChoice,
    pub cast_at: DateTime<Utc>,
}

/// Power totals by choice.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tally {
    pub yes: u64,
    pub no: u64,
    pub abstain: u64,
}

impl Tally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        votes.into_iter().fold(Self::default(), |mut t, v| {
            match v.choice {
                VoteChoice::Yes => t.yes += v.power,
                VoteChoice::No => t.no += v.power,
                VoteChoice::Abstain => t.abstain += v.power,
            }
            t
        })
    }

    /// Total power cast, abstentions included.
    pub fn cast(&self) -> u64 {
        self.yes + self.no + self.abstain
    }
}

/// Registered voters and their token balances.
#[derive(Debug, Clone, Default)]
pub struct VoterRegistry {
    balances: HashMap<String, u64>,
}

impl VoterRegistry {
    pub fn register(&mut self, voter_id: &str, balance: u64) {
        self.balances.insert(voter_id.to_string(), balance);
    }

    pub fn balance(&self, voter_id: &str) -> Option<u64> {
        self.balances.get(voter_id).copied()
    }

    /// Power the electorate would have if every voter spent their full balance.
    pub fn eligible_power(&self) -> u64 {
        self.balances.values().map(|b| voting_power(*b)).sum()
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}
