//! Per-(target, action) circuit breakers
//!
//! CLOSED runs normally and counts consecutive failures; reaching the
//! threshold opens the breaker. OPEN fails fast until the cooldown elapses,
//! then the next caller becomes the single HALF_OPEN probe. Probe success
//! closes the breaker, probe failure re-opens it with a fresh cooldown.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::types::ActionType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub target: String,
    pub action_type: ActionType,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Why a permit was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Open { retry_after: Duration },
    ProbeInFlight,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    open_until: Option<Instant>,
    cooldown_until: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                open_until: None,
                cooldown_until: None,
                probe_in_flight: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Ask to run one attempt. The returned permit must be settled with
    /// `success` or `failure`; dropping it unsettled frees a probe slot.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, Rejection> {
        let now = Instant::now();
        let mut inner = self.lock();
        let probe = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let until = inner.open_until.unwrap_or(now);
                if now < until {
                    return Err(Rejection::Open {
                        retry_after: until - now,
                    });
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Rejection::ProbeInFlight);
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.open_until = None;
            inner.cooldown_until = None;
            info!("Circuit breaker probe succeeded, closing");
        } else if inner.state == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        let trip = if probe {
            inner.probe_in_flight = false;
            true
        } else {
            inner.state == BreakerState::Closed && inner.consecutive_failures >= self.threshold
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.open_until = Some(Instant::now() + self.cooldown);
            inner.cooldown_until = chrono::Duration::from_std(self.cooldown)
                .ok()
                .map(|d| Utc::now() + d);
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                probe,
                "Circuit breaker opened"
            );
        }
    }

    fn on_abandon(&self, probe: bool) {
        if probe {
            self.lock().probe_in_flight = false;
        }
    }

    fn snapshot(&self, target: &str, action_type: ActionType) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            target: target.to_string(),
            action_type,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            cooldown_until: inner.cooldown_until,
        }
    }
}

/// Permission to run one attempt through a breaker.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.probe);
        }
    }
}

/// Lazily created breakers keyed by (target, action type).
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<(String, ActionType), Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, target: &str, action_type: ActionType) -> Arc<CircuitBreaker> {
        let entry = self
            .breakers
            .entry((target.to_string(), action_type))
            .or_insert_with(|| CircuitBreaker::new(self.config.failure_threshold, self.config.cooldown()));
        Arc::clone(entry.value())
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|e| e.value().snapshot(&e.key().0, e.key().1))
            .collect();
        out.sort_by(|a, b| (&a.target, a.action_type).cmp(&(&b.target, b.action_type)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold_and_fails_fast() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            b.try_acquire().unwrap().failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.try_acquire(), Err(Rejection::Open { .. })));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let b = CircuitBreaker::new(3, Duration::from_secs(60));
        b.try_acquire().unwrap().failure();
        b.try_acquire().unwrap().failure();
        b.try_acquire().unwrap().success();
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let b = CircuitBreaker::new(1, Duration::from_millis(10));
        b.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(20));

        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.try_acquire().unwrap_err(), Rejection::ProbeInFlight);

        probe.success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(!b.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_millis(10));
        b.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(20));
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.try_acquire(), Err(Rejection::Open { .. })));
    }

    #[test]
    fn test_dropped_probe_frees_the_slot() {
        let b = CircuitBreaker::new(1, Duration::from_millis(10));
        b.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(20));
        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn test_concurrent_half_open_admits_one_probe() {
        let b = CircuitBreaker::new(1, Duration::from_millis(5));
        b.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(10));

        let barrier = Arc::new(std::sync::Barrier::new(32));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let b = Arc::clone(&b);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    b.try_acquire().ok()
                })
            })
            .collect();
        // permits stay alive until counted, so a finished probe cannot free the slot
        let permits: Vec<BreakerPermit> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert_eq!(permits.len(), 1);
        assert!(permits[0].is_probe());
    }

    #[test]
    fn test_registry_keys_by_target_and_action() {
        let reg = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            cooldown_secs: 60,
        });
        reg.get("a", ActionType::RestartService).try_acquire().unwrap().failure();
        assert_eq!(reg.get("a", ActionType::RestartService).state(), BreakerState::Open);
        assert_eq!(reg.get("a", ActionType::ClearCache).state(), BreakerState::Closed);
        assert_eq!(reg.get("b", ActionType::RestartService).state(), BreakerState::Closed);
        assert_eq!(reg.snapshots().len(), 3);
    }
}
