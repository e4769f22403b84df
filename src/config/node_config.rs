//! Node Configuration - every control-loop tunable as an operator-editable TOML value
//!
//! Each section implements `Default` from `config::defaults`, so a node started
//! without a config file behaves exactly like one with an empty file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "MESH_SENTINEL_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "mesh_sentinel.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one mesh node.
///
/// Load with `NodeConfig::load()` which searches:
/// 1. `$MESH_SENTINEL_CONFIG` env var
/// 2. `./mesh_sentinel.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity and cluster membership
    #[serde(default)]
    pub node: NodeSection,

    /// Anomaly detector thresholds and baseline learning
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Confidence bands of the decision gate
    #[serde(default)]
    pub decision: DecisionConfig,

    /// Quadratic voting defaults and voter stakes
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Election and replication timing
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Recovery execution limits
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Circuit breaker tuning
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Knowledge retention and threshold adaptation
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Control cycle timing
    #[serde(default)]
    pub cycle: CycleConfig,

    /// Persistence backend
    #[serde(default)]
    pub storage: StorageConfig,
}

impl NodeConfig {
    /// Load configuration using the standard search order:
    /// 1. `$MESH_SENTINEL_CONFIG` environment variable
    /// 2. `./mesh_sentinel.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), node = %config.node.id, "Loaded node config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(node = %config.node.id, "Loaded node config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document. Unknown keys are logged as warnings.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate ranges and cross-field ordering.
    ///
    /// Rules:
    /// - Detector thresholds must be positive
    /// - Decision bands must be ordered standard < emergency <= auto-execute <= 1
    /// - Quorum and pass threshold must lie in [0, 1] (pass threshold > 0)
    /// - Election timeout window must be ordered and wider than the heartbeat
    /// - Counts and intervals must be non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.node.id.trim().is_empty() {
            errors.push("node.id must not be empty".to_string());
        }
        if self.node.peers.iter().any(|p| p == &self.node.id) {
            errors.push(format!("node.peers must not contain the node itself ({})", self.node.id));
        }

        let d = &self.detector;
        for (name, v) in [
            ("detector.cpu_percent", d.cpu_percent),
            ("detector.memory_percent", d.memory_percent),
            ("detector.packet_loss_percent", d.packet_loss_percent),
            ("detector.latency_ms", d.latency_ms),
            ("detector.warning_sigma", d.warning_sigma),
            ("detector.min_std_floor", d.min_std_floor),
        ] {
            if !(v.is_finite() && v > 0.0) {
                errors.push(format!("{name} = {v} must be a positive number"));
            }
        }
        if d.min_samples == 0 {
            errors.push("detector.min_samples must be > 0".to_string());
        }

        let g = &self.decision;
        if !(0.0 < g.standard_confidence
            && g.standard_confidence < g.emergency_confidence
            && g.emergency_confidence <= g.auto_execute_confidence
            && g.auto_execute_confidence <= 1.0)
        {
            errors.push(format!(
                "decision bands must satisfy 0 < standard ({}) < emergency ({}) <= auto_execute ({}) <= 1",
                g.standard_confidence, g.emergency_confidence, g.auto_execute_confidence
            ));
        }
        if g.emergency_expiry_secs == 0 || g.standard_expiry_secs == 0 {
            errors.push("decision expiry windows must be > 0".to_string());
        }

        let v = &self.governance;
        if !(0.0..=1.0).contains(&v.quorum_fraction) {
            errors.push(format!("governance.quorum_fraction = {} outside [0, 1]", v.quorum_fraction));
        }
        if !(v.pass_threshold > 0.0 && v.pass_threshold <= 1.0) {
            errors.push(format!("governance.pass_threshold = {} outside (0, 1]", v.pass_threshold));
        }

        let c = &self.consensus;
        if c.election_timeout_min_ms == 0 || c.election_timeout_min_ms > c.election_timeout_max_ms {
            errors.push(format!(
                "consensus election window [{}, {}] ms is not ordered",
                c.election_timeout_min_ms, c.election_timeout_max_ms
            ));
        }
        if c.heartbeat_interval_ms == 0 || c.heartbeat_interval_ms >= c.election_timeout_min_ms {
            errors.push(format!(
                "consensus.heartbeat_interval_ms = {} must be > 0 and below election_timeout_min_ms",
                c.heartbeat_interval_ms
            ));
        }
        if c.leader_lease_ms <= c.heartbeat_interval_ms {
            errors.push("consensus.leader_lease_ms must exceed heartbeat_interval_ms".to_string());
        }
        if c.log_compaction_threshold == 0 || c.applied_key_window == 0 {
            errors.push("consensus.log_compaction_threshold and applied_key_window must be > 0".to_string());
        }

        let e = &self.executor;
        if e.max_attempts == 0 {
            errors.push("executor.max_attempts must be > 0".to_string());
        }
        if e.history_capacity == 0 || e.rate_limit_max_actions == 0 {
            errors.push("executor.history_capacity and rate_limit_max_actions must be > 0".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be > 0".to_string());
        }

        let k = &self.knowledge;
        if !(k.ema_alpha > 0.0 && k.ema_alpha <= 1.0) {
            errors.push(format!("knowledge.ema_alpha = {} outside (0, 1]", k.ema_alpha));
        }
        if !(0.0..1.0).contains(&k.max_threshold_adjustment) {
            errors.push(format!(
                "knowledge.max_threshold_adjustment = {} outside [0, 1)",
                k.max_threshold_adjustment
            ));
        }
        if k.fast_recovery_secs > k.slow_recovery_secs {
            errors.push("knowledge.fast_recovery_secs must not exceed slow_recovery_secs".to_string());
        }

        if self.cycle.interval_ms == 0 || self.cycle.budget_ms == 0 {
            errors.push("cycle.interval_ms and cycle.budget_ms must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Sections
// ============================================================================

/// Identity of this node and the rest of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub id: String,
    /// Other cluster members (never includes `id`)
    pub peers: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: "node-1".to_string(),
            peers: Vec::new(),
        }
    }
}

/// Which scoring backend a node prefers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    /// Fixed per-metric thresholds only
    Rule,
    /// Learned baselines, degrading to rules until ready
    #[default]
    Statistical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: DetectorBackend,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub packet_loss_percent: f64,
    pub latency_ms: f64,
    pub min_samples: usize,
    pub warning_sigma: f64,
    pub min_std_floor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backend: DetectorBackend::default(),
            cpu_percent: defaults::CPU_PERCENT_THRESHOLD,
            memory_percent: defaults::MEMORY_PERCENT_THRESHOLD,
            packet_loss_percent: defaults::PACKET_LOSS_PERCENT_THRESHOLD,
            latency_ms: defaults::LATENCY_MS_THRESHOLD,
            min_samples: defaults::MIN_BASELINE_SAMPLES,
            warning_sigma: defaults::WARNING_SIGMA,
            min_std_floor: defaults::MIN_STD_FLOOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub auto_execute_confidence: f64,
    pub emergency_confidence: f64,
    pub standard_confidence: f64,
    pub emergency_expiry_secs: u64,
    pub standard_expiry_secs: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            auto_execute_confidence: defaults::AUTO_EXECUTE_CONFIDENCE,
            emergency_confidence: defaults::EMERGENCY_CONFIDENCE,
            standard_confidence: defaults::STANDARD_CONFIDENCE,
            emergency_expiry_secs: defaults::EMERGENCY_EXPIRY_SECS,
            standard_expiry_secs: defaults::STANDARD_EXPIRY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub quorum_fraction: f64,
    pub pass_threshold: f64,
    pub retention_secs: u64,
    /// Stake of every cluster member, voted on emergency proposals
    pub node_tokens: u64,
    /// Additional registered voters (operator id -> token balance)
    pub voters: BTreeMap<String, u64>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            quorum_fraction: defaults::QUORUM_FRACTION,
            pass_threshold: defaults::PASS_THRESHOLD,
            retention_secs: defaults::PROPOSAL_RETENTION_SECS,
            node_tokens: defaults::NODE_VOTING_TOKENS,
            voters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub rpc_max_retries: u32,
    pub rpc_backoff_ms: u64,
    pub leader_lease_ms: u64,
    pub observe_only_after_ms: u64,
    pub tick_ms: u64,
    pub log_compaction_threshold: u64,
    pub applied_key_window: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: defaults::ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max_ms: defaults::ELECTION_TIMEOUT_MAX_MS,
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            rpc_timeout_ms: defaults::RPC_TIMEOUT_MS,
            rpc_max_retries: defaults::RPC_MAX_RETRIES,
            rpc_backoff_ms: defaults::RPC_BACKOFF_MS,
            leader_lease_ms: defaults::LEADER_LEASE_MS,
            observe_only_after_ms: defaults::OBSERVE_ONLY_AFTER_MS,
            tick_ms: defaults::CONSENSUS_TICK_MS,
            log_compaction_threshold: defaults::LOG_COMPACTION_THRESHOLD,
            applied_key_window: defaults::APPLIED_KEY_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub action_timeout_ms: u64,
    pub history_capacity: usize,
    pub rate_limit_max_actions: usize,
    pub rate_limit_window_secs: u64,
    pub rollback_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            backoff_base_ms: defaults::ATTEMPT_BACKOFF_MS,
            action_timeout_ms: defaults::ACTION_TIMEOUT_MS,
            history_capacity: defaults::ACTION_HISTORY_CAPACITY,
            rate_limit_max_actions: defaults::RATE_LIMIT_MAX_ACTIONS,
            rate_limit_window_secs: defaults::RATE_LIMIT_WINDOW_SECS,
            rollback_capacity: defaults::ROLLBACK_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::BREAKER_FAILURE_THRESHOLD,
            cooldown_secs: defaults::BREAKER_COOLDOWN_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub recompute_interval_secs: u64,
    pub ema_alpha: f64,
    pub max_threshold_adjustment: f64,
    pub fast_recovery_secs: f64,
    pub slow_recovery_secs: f64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::KNOWLEDGE_TTL_SECS,
            sweep_interval_secs: defaults::KNOWLEDGE_SWEEP_INTERVAL_SECS,
            recompute_interval_secs: defaults::THRESHOLD_RECOMPUTE_INTERVAL_SECS,
            ema_alpha: defaults::EMA_ALPHA,
            max_threshold_adjustment: defaults::MAX_THRESHOLD_ADJUSTMENT,
            fast_recovery_secs: defaults::FAST_RECOVERY_SECS,
            slow_recovery_secs: defaults::SLOW_RECOVERY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub interval_ms: u64,
    pub budget_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::CYCLE_INTERVAL_MS,
            budget_ms: defaults::CYCLE_BUDGET_MS,
        }
    }
}

/// Where consensus state and action history are persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile, lost on restart
    Memory,
    /// Embedded sled database under `data_dir`
    #[default]
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: defaults::DATA_DIR.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_document_equals_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.breaker.failure_threshold, defaults::BREAKER_FAILURE_THRESHOLD);
        assert_eq!(config.detector.backend, DetectorBackend::Statistical);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            [node]
            id = "edge-7"
            peers = ["edge-8", "edge-9"]

            [executor]
            max_attempts = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.node.peers.len(), 2);
        assert_eq!(config.executor.max_attempts, 1);
        assert_eq!(config.executor.action_timeout_ms, defaults::ACTION_TIMEOUT_MS);
    }

    #[test]
    fn test_unordered_decision_bands_rejected() {
        let mut config = NodeConfig::default();
        config.decision.emergency_confidence = 0.5;
        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.contains("decision bands")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_must_be_below_election_timeout() {
        let mut config = NodeConfig::default();
        config.consensus.heartbeat_interval_ms = 400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_in_peers_rejected() {
        let mut config = NodeConfig::default();
        config.node.peers = vec!["node-1".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_preserves_voters() {
        let mut config = NodeConfig::default();
        config.governance.voters.insert("ops-alice".to_string(), 144);
        let text = config.to_toml().unwrap();
        let back = NodeConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.governance.voters.get("ops-alice"), Some(&144));
    }
}
