//! Recovery Executor - runs committed actions safely
//!
//! Guards, in order: at-most-once per action id, one action per target,
//! the (target, action) circuit breaker, then the sliding-window rate limit.
//! A rejected action is never invoked and its state is left untouched.
//!
//! Each execution makes up to `max_attempts` attempts with exponential
//! backoff, every attempt bounded by `action_timeout_ms`. Results go to the
//! bounded history, the knowledge store and the state store.
//!
//! Succeeded actions that have an inverse are kept on a bounded rollback
//! stack; `rollback_last` runs the inverse of the newest one through the same
//! guards.

mod breaker;
mod rate_limiter;
mod remediation;

pub use breaker::{BreakerPermit, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker, Rejection};
pub use rate_limiter::RateLimiter;
pub use remediation::{RemediationHandler, SimulatedRemediation};

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BreakerConfig, ExecutorConfig};
use crate::knowledge::KnowledgeStore;
use crate::storage::StateStore;
use crate::types::{ActionOrigin, ActionStatus, ActionType, NodeId, RecentKeys, RecoveryAction};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Circuit open for {action_type} on {target}")]
    CircuitOpen {
        target: String,
        action_type: ActionType,
        retry_after: Option<Duration>,
    },

    #[error("Target {0} already has an action running")]
    TargetBusy(String),

    #[error("Recovery rate limit reached")]
    RateLimited,

    #[error("Action {0} was already executed")]
    AlreadyExecuted(Uuid),

    #[error("No reversible action to roll back")]
    NothingToRollBack,

    #[error(
        "Action {} failed after {} attempt(s): {}",
        .action.id,
        .action.attempt_count,
        .action.error.as_deref().unwrap_or("unknown error")
    )]
    Failed { action: Box<RecoveryAction> },
}

/// Removes the target's in-flight marker on every exit path.
struct TargetGuard<'a> {
    in_flight: &'a DashMap<String, Uuid>,
    target: String,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.target);
    }
}

pub struct RecoveryExecutor {
    node_id: NodeId,
    config: ExecutorConfig,
    handler: Arc<dyn RemediationHandler>,
    breakers: BreakerRegistry,
    limiter: RateLimiter,
    in_flight: DashMap<String, Uuid>,
    /// Ids already consumed, as many as the history holds
    executed: Mutex<RecentKeys>,
    history: Mutex<VecDeque<RecoveryAction>>,
    /// Succeeded reversible actions, newest last
    rollback: Mutex<VecDeque<RecoveryAction>>,
    knowledge: Option<Arc<KnowledgeStore>>,
    store: Option<Arc<dyn StateStore>>,
}

impl RecoveryExecutor {
    pub fn new(
        node_id: &str,
        config: ExecutorConfig,
        breaker: BreakerConfig,
        handler: Arc<dyn RemediationHandler>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit_max_actions,
            Duration::from_secs(config.rate_limit_window_secs),
        );
        Self {
            node_id: node_id.to_string(),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1024))),
            executed: Mutex::new(RecentKeys::new(config.history_capacity)),
            rollback: Mutex::new(VecDeque::with_capacity(config.rollback_capacity.min(1024))),
            config,
            handler,
            breakers: BreakerRegistry::new(breaker),
            limiter,
            in_flight: DashMap::new(),
            knowledge: None,
            store: None,
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    /// Attach persistence and reload the recent history, so actions executed
    /// before a restart stay deduplicated.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        match store.action_history(self.config.history_capacity) {
            Ok(previous) => {
                let restored = previous.len();
                if let Ok(mut history) = self.history.lock() {
                    for action in previous.into_iter().rev() {
                        self.remember(action.id);
                        history.push_back(action);
                    }
                }
                debug!(node = %self.node_id, restored, "Executor history restored");
            }
            Err(e) => warn!(node = %self.node_id, error = %e, "Could not reload action history"),
        }
        self.store = Some(store);
        self
    }

    fn remember(&self, id: Uuid) {
        if let Ok(mut executed) = self.executed.lock() {
            executed.insert(id, 0);
        }
    }

    fn was_executed(&self, id: &Uuid) -> bool {
        self.executed.lock().map(|e| e.contains(id)).unwrap_or(false)
    }

    /// Run one committed action to completion.
    ///
    /// Returns the finished action on success; `Failed` carries it on failure.
    pub async fn execute(&self, mut action: RecoveryAction) -> Result<RecoveryAction, ExecutionError> {
        if self.was_executed(&action.id) || action.status != ActionStatus::Pending {
            debug!(action = %action.id, "Skipping already executed action");
            return Err(ExecutionError::AlreadyExecuted(action.id));
        }

        let _target = self.claim_target(&action)?;

        let breaker = self.breakers.get(&action.target_node, action.action_type);
        let first_permit = breaker.try_acquire().map_err(|rejection| {
            info!(
                action = %action.id,
                target = %action.target_node,
                kind = %action.action_type,
                "Circuit open, action not invoked"
            );
            ExecutionError::CircuitOpen {
                target: action.target_node.clone(),
                action_type: action.action_type,
                retry_after: match rejection {
                    Rejection::Open { retry_after } => Some(retry_after),
                    Rejection::ProbeInFlight => None,
                },
            }
        })?;

        if !self.limiter.try_acquire() {
            warn!(action = %action.id, target = %action.target_node, "Recovery rate limit reached");
            return Err(ExecutionError::RateLimited);
        }

        // past this point the action is consumed, whatever the outcome
        self.remember(action.id);
        action.assigned_executor.get_or_insert_with(|| self.node_id.clone());
        action.transition(ActionStatus::Running);
        info!(
            node = %self.node_id,
            action = %action.id,
            kind = %action.action_type,
            target = %action.target_node,
            probe = first_permit.is_probe(),
            "Executing recovery action"
        );

        let (succeeded, last_error) = self.run_attempts(&mut action, &breaker, first_permit).await;

        action.error = last_error;
        action.transition(if succeeded {
            ActionStatus::Succeeded
        } else {
            ActionStatus::Failed
        });
        self.archive(&action);

        if succeeded {
            info!(
                action = %action.id,
                target = %action.target_node,
                attempts = action.attempt_count,
                recovery_secs = action.recovery_secs().unwrap_or(0.0),
                "Recovery action succeeded"
            );
            Ok(action)
        } else {
            warn!(
                action = %action.id,
                target = %action.target_node,
                attempts = action.attempt_count,
                error = action.error.as_deref().unwrap_or(""),
                "Recovery action failed"
            );
            Err(ExecutionError::Failed {
                action: Box::new(action),
            })
        }
    }

    fn claim_target(&self, action: &RecoveryAction) -> Result<TargetGuard<'_>, ExecutionError> {
        match self.in_flight.entry(action.target_node.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(target = %action.target_node, action = %action.id, "Target busy, rejecting");
                Err(ExecutionError::TargetBusy(action.target_node.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(action.id);
                Ok(TargetGuard {
                    in_flight: &self.in_flight,
                    target: action.target_node.clone(),
                })
            }
        }
    }

    async fn run_attempts(
        &self,
        action: &mut RecoveryAction,
        breaker: &Arc<CircuitBreaker>,
        first_permit: BreakerPermit,
    ) -> (bool, Option<String>) {
        let max_attempts = self.config.max_attempts.max(1);
        let timeout = Duration::from_millis(self.config.action_timeout_ms);
        let mut pending_permit = Some(first_permit);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let permit = match pending_permit.take() {
                Some(p) => p,
                None => match breaker.try_acquire() {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            action.attempt_count = attempt;

            match tokio::time::timeout(timeout, self.handler.remediate(action)).await {
                Ok(Ok(())) => {
                    permit.success();
                    return (true, None);
                }
                Ok(Err(e)) => {
                    permit.failure();
                    last_error = Some(format!("{e:#}"));
                }
                Err(_) => {
                    permit.failure();
                    last_error = Some(format!("timed out after {} ms", timeout.as_millis()));
                }
            }
            debug!(
                action = %action.id,
                attempt,
                max_attempts,
                error = last_error.as_deref().unwrap_or(""),
                "Attempt failed"
            );

            if breaker.state() == BreakerState::Open || attempt == max_attempts {
                break;
            }
            let backoff = Duration::from_millis(self.config.backoff_base_ms)
                .saturating_mul(1u32 << (attempt - 1).min(10));
            tokio::time::sleep(backoff).await;
        }
        (false, last_error)
    }

    fn archive(&self, action: &RecoveryAction) {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(action.clone());
            while history.len() > self.config.history_capacity.max(1) {
                history.pop_front();
            }
        }
        let undo = matches!(action.origin, ActionOrigin::Rollback(_));
        if !undo && action.status == ActionStatus::Succeeded && action.action_type.inverse().is_some() {
            self.push_rollback(action.clone());
        }
        // an undo says nothing about how well a remediation works
        if let (Some(knowledge), false) = (&self.knowledge, undo) {
            knowledge.record_outcome(action);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.record_action(action) {
                warn!(action = %action.id, error = %e, "Failed to persist action");
            }
        }
    }

    fn push_rollback(&self, action: RecoveryAction) {
        if let Ok(mut stack) = self.rollback.lock() {
            stack.push_back(action);
            while stack.len() > self.config.rollback_capacity.max(1) {
                stack.pop_front();
            }
        }
    }

    /// Undo the newest succeeded reversible action by executing its inverse.
    ///
    /// The inverse is a fresh action with `ActionOrigin::Rollback`, so it
    /// passes the target, breaker and rate-limit guards like any other. If a
    /// guard turns it away before invocation the record stays on the stack;
    /// once invoked it is consumed, even if the inverse fails.
    pub async fn rollback_last(&self) -> Result<RecoveryAction, ExecutionError> {
        let original = self
            .rollback
            .lock()
            .ok()
            .and_then(|mut stack| stack.pop_back())
            .ok_or(ExecutionError::NothingToRollBack)?;
        let inverse = original
            .action_type
            .inverse()
            .ok_or(ExecutionError::NothingToRollBack)?;
        info!(
            node = %self.node_id,
            action = %original.id,
            kind = %original.action_type,
            inverse = %inverse,
            target = %original.target_node,
            "Rolling back action"
        );

        let undo = RecoveryAction::new(
            inverse,
            &original.target_node,
            original.issue,
            ActionOrigin::Rollback(original.id),
        );
        match self.execute(undo).await {
            Ok(done) => Ok(done),
            Err(
                e @ (ExecutionError::TargetBusy(_) | ExecutionError::CircuitOpen { .. } | ExecutionError::RateLimited),
            ) => {
                debug!(action = %original.id, error = %e, "Rollback not started, keeping record");
                if let Ok(mut stack) = self.rollback.lock() {
                    stack.push_back(original);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Reversible actions that `rollback_last` can still undo
    pub fn rollback_depth(&self) -> usize {
        self.rollback.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Rolling success rate over the history window; `None` before any action ran.
    pub fn success_rate(&self) -> Option<f64> {
        let history = self.history.lock().ok()?;
        if history.is_empty() {
            return None;
        }
        let ok = history.iter().filter(|a| a.status == ActionStatus::Succeeded).count();
        Some(ok as f64 / history.len() as f64)
    }

    /// Most recent first
    pub fn history(&self, limit: usize) -> Vec<RecoveryAction> {
        self.history
            .lock()
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn breaker(&self, target: &str, action_type: ActionType) -> Arc<CircuitBreaker> {
        self.breakers.get(target, action_type)
    }

    pub fn is_target_busy(&self, target: &str) -> bool {
        self.in_flight.contains_key(target)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler.name()
    }
}
