//! Persistent node state
//!
//! Consensus term/vote/log and the recovery-action archive, behind the
//! `StateStore` trait. Values are JSON-encoded.

mod persistence;
mod sled_store;

pub use persistence::{InMemoryStateStore, PersistedConsensus, StateStore, StorageError};
pub use sled_store::SledStateStore;

use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};

/// Open the backend selected in `[storage]`, under a per-node subdirectory.
pub fn open_store(config: &StorageConfig, node_id: &str) -> Result<Arc<dyn StateStore>, StorageError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryStateStore::new())),
        StorageBackend::Sled => {
            let path = std::path::Path::new(&config.data_dir).join(node_id);
            Ok(Arc::new(SledStateStore::open(path)?))
        }
    }
}
