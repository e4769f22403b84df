//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use std::collections::HashSet;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Tables whose children are user-chosen names rather than fixed fields.
const OPEN_TABLES: &[&str] = &["governance.voters"];

/// Returns the complete set of valid dotted key paths for NodeConfig.
///
/// Maintained by hand to match the struct hierarchy in node_config.rs.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [node]
        "node",
        "node.id",
        "node.peers",
        // [detector]
        "detector",
        "detector.backend",
        "detector.cpu_percent",
        "detector.memory_percent",
        "detector.packet_loss_percent",
        "detector.latency_ms",
        "detector.min_samples",
        "detector.warning_sigma",
        "detector.min_std_floor",
        // [decision]
        "decision",
        "decision.auto_execute_confidence",
        "decision.emergency_confidence",
        "decision.standard_confidence",
        "decision.emergency_expiry_secs",
        "decision.standard_expiry_secs",
        // [governance]
        "governance",
        "governance.quorum_fraction",
        "governance.pass_threshold",
        "governance.retention_secs",
        "governance.node_tokens",
        "governance.voters",
        // [consensus]
        "consensus",
        "consensus.election_timeout_min_ms",
        "consensus.election_timeout_max_ms",
        "consensus.heartbeat_interval_ms",
        "consensus.rpc_timeout_ms",
        "consensus.rpc_max_retries",
        "consensus.rpc_backoff_ms",
        "consensus.leader_lease_ms",
        "consensus.observe_only_after_ms",
        "consensus.tick_ms",
        "consensus.log_compaction_threshold",
        "consensus.applied_key_window",
        // [executor]
        "executor",
        "executor.max_attempts",
        "executor.backoff_base_ms",
        "executor.action_timeout_ms",
        "executor.history_capacity",
        "executor.rate_limit_max_actions",
        "executor.rate_limit_window_secs",
        "executor.rollback_capacity",
        // [breaker]
        "breaker",
        "breaker.failure_threshold",
        "breaker.cooldown_secs",
        // [knowledge]
        "knowledge",
        "knowledge.ttl_secs",
        "knowledge.sweep_interval_secs",
        "knowledge.recompute_interval_secs",
        "knowledge.ema_alpha",
        "knowledge.max_threshold_adjustment",
        "knowledge.fast_recovery_secs",
        "knowledge.slow_recovery_secs",
        // [cycle]
        "cycle",
        "cycle.interval_ms",
        "cycle.budget_ms",
        // [storage]
        "storage",
        "storage.backend",
        "storage.data_dir",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// Children of open tables (see `OPEN_TABLES`) are not descended into.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() && !OPEN_TABLES.contains(&path.as_str()) {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (*k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by(|(ka, da), (kb, db)| da.cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// Parse errors yield no warnings here; serde reports them afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}
