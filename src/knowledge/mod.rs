//! Knowledge Store - the K of the MAPE-K loop
//!
//! Append-only, TTL-bounded log of anomaly events and recovery outcomes.
//!
//! ## Storage
//!
//! Records live in a sharded `DashMap` keyed by a monotonically increasing
//! sequence number handed out by an atomic counter. Appends touch a single
//! shard; `sweep()` evicts expired records shard by shard, so readers and
//! writers on other shards are never blocked.
//!
//! ## Feedback
//!
//! `recompute_thresholds()` folds outcomes recorded since the previous run into
//! per-metric EMAs and publishes new detector thresholds (see `adaptive`).

mod adaptive;

pub use adaptive::OutcomeSignal;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::KnowledgeConfig;
use crate::detector::{FeatureThresholds, SharedThresholds};
use crate::types::{ActionStatus, ActionType, AnomalyEvent, IssueKind, NodeId, RecoveryAction};

use adaptive::AdaptiveState;

/// Archived result of one executed recovery action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub target_node: NodeId,
    pub issue: IssueKind,
    pub success: bool,
    pub attempts: u32,
    /// Time to recover (seconds), zero when unknown
    pub recovery_secs: f64,
    pub recorded_at: DateTime<Utc>,
}

impl ActionOutcome {
    pub fn from_action(action: &RecoveryAction) -> Self {
        Self {
            action_id: action.id,
            action_type: action.action_type,
            target_node: action.target_node.clone(),
            issue: action.issue,
            success: action.status == ActionStatus::Succeeded,
            attempts: action.attempt_count,
            recovery_secs: action.recovery_secs().unwrap_or(0.0),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KnowledgeRecord {
    Anomaly(AnomalyEvent),
    Outcome(ActionOutcome),
}

struct Entry {
    record: KnowledgeRecord,
    inserted_at: Instant,
}

/// Counters exposed on the status surface
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeStats {
    pub live_records: usize,
    pub anomalies_recorded: u64,
    pub outcomes_recorded: u64,
    pub evicted: u64,
}

pub struct KnowledgeStore {
    entries: DashMap<u64, Entry>,
    next_seq: AtomicU64,
    anomalies_recorded: AtomicU64,
    outcomes_recorded: AtomicU64,
    evicted: AtomicU64,
    ttl: Duration,
    config: KnowledgeConfig,
    /// Thresholds as configured; adaptation is bounded relative to these
    baseline: FeatureThresholds,
    thresholds: SharedThresholds,
    adaptive: Mutex<AdaptiveState>,
}

impl KnowledgeStore {
    pub fn new(config: KnowledgeConfig, thresholds: SharedThresholds) -> Self {
        let baseline = thresholds.load().as_ref().clone();
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(1),
            anomalies_recorded: AtomicU64::new(0),
            outcomes_recorded: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            ttl: Duration::from_secs(config.ttl_secs),
            config,
            baseline,
            thresholds,
            adaptive: Mutex::new(AdaptiveState::default()),
        }
    }

    /// Override the record lifetime (tests and short-lived simulations).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn append(&self, record: KnowledgeRecord) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            seq,
            Entry {
                record,
                inserted_at: Instant::now(),
            },
        );
        seq
    }

    pub fn record_anomaly(&self, event: &AnomalyEvent) -> u64 {
        self.anomalies_recorded.fetch_add(1, Ordering::Relaxed);
        self.append(KnowledgeRecord::Anomaly(event.clone()))
    }

    /// Archive a finished action. Actions still pending or running are ignored.
    pub fn record_outcome(&self, action: &RecoveryAction) -> Option<u64> {
        if action.status.is_active() {
            return None;
        }
        self.outcomes_recorded.fetch_add(1, Ordering::Relaxed);
        Some(self.append(KnowledgeRecord::Outcome(ActionOutcome::from_action(action))))
    }

    /// Evict records older than the TTL. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = self.entries.len(), "Knowledge sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> KnowledgeStats {
        KnowledgeStats {
            live_records: self.entries.len(),
            anomalies_recorded: self.anomalies_recorded.load(Ordering::Relaxed),
            outcomes_recorded: self.outcomes_recorded.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Vec<KnowledgeRecord> {
        let mut seqs: Vec<(u64, KnowledgeRecord)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().record.clone()))
            .collect();
        seqs.sort_by(|a, b| b.0.cmp(&a.0));
        seqs.into_iter().take(limit).map(|(_, r)| r).collect()
    }

    fn outcomes(&self) -> Vec<ActionOutcome> {
        self.entries
            .iter()
            .filter_map(|e| match &e.value().record {
                KnowledgeRecord::Outcome(o) => Some(o.clone()),
                KnowledgeRecord::Anomaly(_) => None,
            })
            .collect()
    }

    /// Fraction of archived outcomes that succeeded.
    pub fn success_rate(&self) -> Option<f64> {
        let outcomes = self.outcomes();
        if outcomes.is_empty() {
            return None;
        }
        let ok = outcomes.iter().filter(|o| o.success).count();
        Some(ok as f64 / outcomes.len() as f64)
    }

    /// Mean time-to-recover of successful outcomes for an issue.
    pub fn mean_recovery_secs(&self, issue: IssueKind) -> Option<f64> {
        let times: Vec<f64> = self
            .outcomes()
            .into_iter()
            .filter(|o| o.success && o.issue == issue)
            .map(|o| o.recovery_secs)
            .collect();
        (!times.is_empty()).then(|| times.iter().sum::<f64>() / times.len() as f64)
    }

    /// Action type with the lowest mean time-to-recover among successful
    /// outcomes for `issue`, if any succeeded.
    pub fn recommended_action(&self, issue: IssueKind) -> Option<ActionType> {
        let mut by_type: BTreeMap<ActionType, (f64, usize)> = BTreeMap::new();
        for o in self.outcomes().into_iter().filter(|o| o.success && o.issue == issue) {
            let slot = by_type.entry(o.action_type).or_insert((0.0, 0));
            slot.0 += o.recovery_secs;
            slot.1 += 1;
        }
        by_type
            .into_iter()
            .map(|(t, (sum, n))| (t, sum / n as f64))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(t, _)| t)
    }

    /// Current detector thresholds.
    pub fn thresholds(&self) -> Arc<FeatureThresholds> {
        self.thresholds.load_full()
    }

    /// Fold outcomes recorded since the last run into the adaptive EMAs and
    /// publish the resulting thresholds. Returns the new thresholds.
    pub fn recompute_thresholds(&self) -> FeatureThresholds {
        let Ok(mut state) = self.adaptive.lock() else {
            return self.thresholds.load().as_ref().clone();
        };

        let mut fresh: Vec<(u64, ActionOutcome)> = self
            .entries
            .iter()
            .filter(|e| *e.key() > state.cursor)
            .filter_map(|e| match &e.value().record {
                KnowledgeRecord::Outcome(o) => Some((*e.key(), o.clone())),
                KnowledgeRecord::Anomaly(_) => None,
            })
            .collect();
        fresh.sort_by_key(|(seq, _)| *seq);

        let folded = fresh.len();
        for (seq, outcome) in fresh {
            let signal = OutcomeSignal::classify(&outcome, &self.config);
            state.fold(outcome.issue, signal, self.config.ema_alpha);
            state.cursor = state.cursor.max(seq);
        }

        let next = state.apply(&self.baseline, self.config.max_threshold_adjustment);
        drop(state);

        if folded > 0 {
            info!(
                outcomes = folded,
                warning_sigma = %format!("{:.2}", next.warning_sigma),
                "Adaptive thresholds recomputed"
            );
        }
        self.thresholds.store(Arc::new(next.clone()));
        next
    }
}
