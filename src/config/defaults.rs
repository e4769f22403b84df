//! System-wide default constants.
//!
//! Every tunable in `mesh_sentinel.toml` falls back to one of these values.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Detector
// ============================================================================

/// CPU utilisation above which a node is anomalous (%).
pub const CPU_PERCENT_THRESHOLD: f64 = 90.0;

/// Memory utilisation above which a node is anomalous (%).
pub const MEMORY_PERCENT_THRESHOLD: f64 = 85.0;

/// Packet loss above which a link is anomalous (%).
pub const PACKET_LOSS_PERCENT_THRESHOLD: f64 = 5.0;

/// Round-trip latency above which a link is anomalous (ms).
pub const LATENCY_MS_THRESHOLD: f64 = 200.0;

/// Relative excess over a threshold at which the rule detector is fully confident.
///
/// 0.10 means a reading 10% above its threshold scores 1.0.
pub const RULE_SATURATION_EXCESS: f64 = 0.10;

/// Samples per (node, metric) before the statistical baseline is usable.
pub const MIN_BASELINE_SAMPLES: usize = 30;

/// Z-score at which the statistical detector crosses its decision boundary.
pub const WARNING_SIGMA: f64 = 3.0;

/// Floor on baseline standard deviation, avoids infinite z-scores on flat metrics.
pub const MIN_STD_FLOOR: f64 = 0.5;

// ============================================================================
// Decision Gate
// ============================================================================

/// Confidence at or above which a decision is committed without a vote.
pub const AUTO_EXECUTE_CONFIDENCE: f64 = 0.9;

/// Confidence at or above which an emergency proposal is opened.
pub const EMERGENCY_CONFIDENCE: f64 = 0.8;

/// Confidence at or above which a standard proposal is opened.
pub const STANDARD_CONFIDENCE: f64 = 0.6;

/// Emergency proposal lifetime (seconds). 300 = 5 minutes.
pub const EMERGENCY_EXPIRY_SECS: u64 = 300;

/// Standard proposal lifetime (seconds). 3 600 = 1 hour.
pub const STANDARD_EXPIRY_SECS: u64 = 3_600;

// ============================================================================
// Governance
// ============================================================================

/// Fraction of eligible voting power that must participate.
pub const QUORUM_FRACTION: f64 = 0.5;

/// Fraction of cast power that must vote yes.
pub const PASS_THRESHOLD: f64 = 0.5;

/// How long resolved proposals are kept before eviction (seconds).
pub const PROPOSAL_RETENTION_SECS: u64 = 3_600;

/// Token stake of each cluster member; members vote it on emergency proposals.
pub const NODE_VOTING_TOKENS: u64 = 100;

// ============================================================================
// Consensus
// ============================================================================

/// Lower bound of the randomized election timeout (ms).
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 150;

/// Upper bound of the randomized election timeout (ms).
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 300;

/// Leader heartbeat period (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 50;

/// Per-call RPC deadline (ms).
pub const RPC_TIMEOUT_MS: u64 = 1_000;

/// Retries for forwarded commit requests after the first attempt.
pub const RPC_MAX_RETRIES: u32 = 2;

/// Base backoff between RPC retries (ms), doubled per retry.
pub const RPC_BACKOFF_MS: u64 = 25;

/// Leader lease: a leader without majority acks for this long steps down (ms).
pub const LEADER_LEASE_MS: u64 = 600;

/// Leaderless period after which a node enters observe-only mode (ms).
pub const OBSERVE_ONLY_AFTER_MS: u64 = 2_000;

/// Consensus driver tick period (ms).
pub const CONSENSUS_TICK_MS: u64 = 10;

/// Applied entries kept in the log before the prefix is folded into a snapshot.
pub const LOG_COMPACTION_THRESHOLD: u64 = 512;

/// Most recent applied idempotency keys remembered past compaction.
pub const APPLIED_KEY_WINDOW: usize = 1_024;

// ============================================================================
// Executor
// ============================================================================

/// Attempts per recovery action, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base backoff between attempts (ms), doubled per retry.
pub const ATTEMPT_BACKOFF_MS: u64 = 100;

/// Reversible actions remembered for `rollback_last`.
pub const ROLLBACK_CAPACITY: usize = 100;

/// Deadline for a single remediation attempt (ms).
pub const ACTION_TIMEOUT_MS: u64 = 5_000;

/// Executed actions kept in the rolling history ring buffer.
pub const ACTION_HISTORY_CAPACITY: usize = 1_000;

/// Maximum recovery actions per rate-limit window.
pub const RATE_LIMIT_MAX_ACTIONS: usize = 10;

/// Rate-limit window (seconds).
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Consecutive failures that open a circuit breaker.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Time an open breaker waits before allowing a probe (seconds).
pub const BREAKER_COOLDOWN_SECS: u64 = 60;

// ============================================================================
// Knowledge
// ============================================================================

/// Knowledge record lifetime (seconds). 86 400 = 24 hours.
pub const KNOWLEDGE_TTL_SECS: u64 = 86_400;

/// Interval between TTL sweeps (seconds).
pub const KNOWLEDGE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Interval between adaptive threshold recomputations (seconds).
pub const THRESHOLD_RECOMPUTE_INTERVAL_SECS: u64 = 30;

/// EMA smoothing factor for outcome feedback.
pub const EMA_ALPHA: f64 = 0.2;

/// Maximum relative movement of an adaptive threshold away from its configured value.
///
/// 0.5 keeps every threshold within [50%, 150%] of its baseline.
pub const MAX_THRESHOLD_ADJUSTMENT: f64 = 0.5;

/// Recoveries faster than this relax thresholds (seconds).
pub const FAST_RECOVERY_SECS: f64 = 3.0;

/// Recoveries slower than this tighten thresholds (seconds).
pub const SLOW_RECOVERY_SECS: f64 = 7.0;

// ============================================================================
// Control Cycle
// ============================================================================

/// Monitor→decide cycle period (ms).
pub const CYCLE_INTERVAL_MS: u64 = 1_000;

/// Budget for a single cycle before it is aborted (ms).
pub const CYCLE_BUDGET_MS: u64 = 800;

/// Default sled directory for persisted node state.
pub const DATA_DIR: &str = "./data/mesh_sentinel";
