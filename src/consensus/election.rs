//! Randomized election timing and vote counting

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::types::NodeId;

/// Strict majority of a cluster of `cluster_size` voters.
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Follower/candidate election deadline with a fresh random timeout on every reset.
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    rng: StdRng,
    timeout: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration, now: Instant) -> Self {
        Self::with_rng(min, max, StdRng::from_entropy(), now)
    }

    pub fn seeded(min: Duration, max: Duration, seed: u64, now: Instant) -> Self {
        Self::with_rng(min, max, StdRng::seed_from_u64(seed), now)
    }

    fn with_rng(min: Duration, max: Duration, mut rng: StdRng, now: Instant) -> Self {
        let max = max.max(min);
        let timeout = random_between(&mut rng, min, max);
        Self {
            min,
            max,
            rng,
            timeout,
            deadline: now + timeout,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.timeout = random_between(&mut self.rng, self.min, self.max);
        self.deadline = now + self.timeout;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn random_between(rng: &mut StdRng, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let delta = (max - min).as_millis() as u64;
    min + Duration::from_millis(rng.gen_range(0..=delta))
}

/// Votes collected by a candidate for one term.
#[derive(Debug, Clone)]
pub struct CandidateState {
    term: u64,
    granted: HashSet<NodeId>,
    rejected: HashSet<NodeId>,
}

impl CandidateState {
    /// A candidate always votes for itself.
    pub fn new(candidate_id: &str, term: u64) -> Self {
        let mut granted = HashSet::new();
        granted.insert(candidate_id.to_string());
        Self {
            term,
            granted,
            rejected: HashSet::new(),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn record_vote(&mut self, voter: &str, granted: bool) {
        if granted {
            self.rejected.remove(voter);
            self.granted.insert(voter.to_string());
        } else {
            self.granted.remove(voter);
            self.rejected.insert(voter.to_string());
        }
    }

    pub fn votes_granted(&self) -> usize {
        self.granted.len()
    }

    pub fn quorum_reached(&self, quorum: usize) -> bool {
        self.granted.len() >= quorum
    }
}
