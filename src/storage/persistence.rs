//! StateStore trait: pluggable persistence backend
//!
//! Abstracts consensus state and recovery-action history so the backend can be
//! swapped without touching the coordinator or executor:
//! - `InMemoryStateStore`: for tests and ephemeral simulation nodes
//! - `SledStateStore`: embedded on-disk store for real deployments

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::RwLock;
use uuid::Uuid;

use crate::consensus::LogEntry;
use crate::types::RecoveryAction;

/// Everything a node needs to rejoin the cluster after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistedConsensus {
    pub term: u64,
    pub voted_for: Option<String>,
    /// Last index folded into the snapshot, and its term
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    /// Entries after the snapshot
    pub log: Vec<LogEntry>,
    pub commit_index: u64,
    /// Most recent idempotency keys applied on this node, with their log index
    pub applied_keys: Vec<(Uuid, u64)>,
}

/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks.
pub trait StateStore: Send + Sync {
    fn save_consensus(&self, state: &PersistedConsensus) -> Result<(), StorageError>;

    fn load_consensus(&self) -> Result<Option<PersistedConsensus>, StorageError>;

    /// Archive a finished recovery action
    fn record_action(&self, action: &RecoveryAction) -> Result<(), StorageError>;

    /// Most recent first
    fn action_history(&self, limit: usize) -> Result<Vec<RecoveryAction>, StorageError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// In-memory persistence for tests and simulation.
///
/// Thread-safe via `RwLock`. Not durable; data is lost on restart.
pub struct InMemoryStateStore {
    consensus: RwLock<Option<PersistedConsensus>>,
    actions: RwLock<VecDeque<RecoveryAction>>,
    max_actions: usize,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_capacity(crate::config::defaults::ACTION_HISTORY_CAPACITY)
    }

    pub fn with_capacity(max_actions: usize) -> Self {
        Self {
            consensus: RwLock::new(None),
            actions: RwLock::new(VecDeque::new()),
            max_actions: max_actions.max(1),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStateStore {
    fn save_consensus(&self, state: &PersistedConsensus) -> Result<(), StorageError> {
        let mut slot = self.consensus.write().map_err(|_| StorageError::Poisoned)?;
        *slot = Some(state.clone());
        Ok(())
    }

    fn load_consensus(&self) -> Result<Option<PersistedConsensus>, StorageError> {
        let slot = self.consensus.read().map_err(|_| StorageError::Poisoned)?;
        Ok(slot.clone())
    }

    fn record_action(&self, action: &RecoveryAction) -> Result<(), StorageError> {
        let mut store = self.actions.write().map_err(|_| StorageError::Poisoned)?;
        store.push_back(action.clone());
        // Evict oldest if over limit
        while store.len() > self.max_actions {
            store.pop_front();
        }
        Ok(())
    }

    fn action_history(&self, limit: usize) -> Result<Vec<RecoveryAction>, StorageError> {
        let store = self.actions.read().map_err(|_| StorageError::Poisoned)?;
        Ok(store.iter().rev().take(limit).cloned().collect())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
