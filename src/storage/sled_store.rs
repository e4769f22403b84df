//! Sled-backed StateStore
//!
//! Two trees: `consensus` holds a single JSON document under a fixed key,
//! `actions` holds archived recovery actions keyed by a monotonically
//! increasing id (big-endian, so iteration is chronological).

use std::path::Path;
use std::sync::Arc;

use super::persistence::{PersistedConsensus, StateStore, StorageError};
use crate::types::RecoveryAction;

const CONSENSUS_TREE: &str = "consensus";
const ACTIONS_TREE: &str = "actions";
const CONSENSUS_KEY: &[u8] = b"state";

#[derive(Clone)]
pub struct SledStateStore {
    db: Arc<sled::Db>,
    consensus: sled::Tree,
    actions: sled::Tree,
}

impl SledStateStore {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        let consensus = db.open_tree(CONSENSUS_TREE)?;
        let actions = db.open_tree(ACTIONS_TREE)?;
        tracing::info!(path = ?path_ref, actions = actions.len(), "State store opened");
        Ok(Self {
            db: Arc::new(db),
            consensus,
            actions,
        })
    }
}

impl StateStore for SledStateStore {
    /// Flushed on every write: term and vote must survive a crash.
    fn save_consensus(&self, state: &PersistedConsensus) -> Result<(), StorageError> {
        let value = serde_json::to_vec(state)?;
        self.consensus.insert(CONSENSUS_KEY, value)?;
        self.consensus.flush()?;
        Ok(())
    }

    fn load_consensus(&self) -> Result<Option<PersistedConsensus>, StorageError> {
        match self.consensus.get(CONSENSUS_KEY)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Not flushed per write; sled's background flush is enough for history.
    fn record_action(&self, action: &RecoveryAction) -> Result<(), StorageError> {
        let key = self.db.generate_id()?.to_be_bytes();
        let value = serde_json::to_vec(action)?;
        self.actions.insert(key, value)?;
        Ok(())
    }

    fn action_history(&self, limit: usize) -> Result<Vec<RecoveryAction>, StorageError> {
        let mut out = Vec::with_capacity(limit.min(64));
        for item in self.actions.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            match serde_json::from_slice::<RecoveryAction>(&value) {
                Ok(action) => out.push(action),
                Err(e) => tracing::warn!("Skipping unreadable action record: {}", e),
            }
        }
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
