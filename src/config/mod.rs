//! Node Configuration Module
//!
//! Provides per-node configuration loaded from TOML files; every threshold,
//! timeout and limit of the control loop is operator-tunable.
//!
//! ## Loading Order
//!
//! 1. `MESH_SENTINEL_CONFIG` environment variable (path to TOML file)
//! 2. `mesh_sentinel.toml` in the current working directory
//! 3. Built-in defaults (see `defaults`)
//!
//! ## Usage
//!
//! ```ignore
//! // In main():
//! config::init(NodeConfig::load());
//!
//! // Anywhere in the codebase:
//! let lease = config::get().consensus.leader_lease_ms;
//! ```

mod node_config;
pub mod defaults;
pub mod validation;

pub use node_config::*;

use std::sync::OnceLock;

/// Global node configuration, initialized once at startup.
static NODE_CONFIG: OnceLock<NodeConfig> = OnceLock::new();

/// Built-in defaults handed out when `init()` was never called.
static FALLBACK_CONFIG: OnceLock<NodeConfig> = OnceLock::new();

/// Initialize the global node configuration.
///
/// A second call is ignored with a warning.
pub fn init(config: NodeConfig) {
    if NODE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global node configuration.
///
/// Before `init()` this returns the built-in defaults.
pub fn get() -> &'static NodeConfig {
    NODE_CONFIG
        .get()
        .unwrap_or_else(|| FALLBACK_CONFIG.get_or_init(NodeConfig::default))
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    NODE_CONFIG.get().is_some()
}
