//! Sliding-window cap on recovery actions

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Allows at most `max_actions` acquisitions in any trailing `window`.
pub struct RateLimiter {
    max_actions: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_actions: usize, window: Duration) -> Self {
        Self {
            max_actions,
            window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(issued: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while issued.front().is_some_and(|t| now.duration_since(*t) >= window) {
            issued.pop_front();
        }
    }

    /// Take a slot if one is free. Check and record happen atomically.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let Ok(mut issued) = self.issued.lock() else {
            return false;
        };
        Self::prune(&mut issued, self.window, now);
        if issued.len() >= self.max_actions {
            return false;
        }
        issued.push_back(now);
        true
    }

    /// Slots still free in the current window.
    pub fn remaining(&self) -> usize {
        let Ok(mut issued) = self.issued.lock() else {
            return 0;
        };
        Self::prune(&mut issued, self.window, Instant::now());
        self.max_actions.saturating_sub(issued.len())
    }
}
