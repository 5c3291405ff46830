//! In-memory checkpoint store

use crate::codec::{decode_checkpoint, encode_checkpoint};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strand_core::{Checkpoint, CheckpointStore, RunId, StoreError};

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    revision: u64,
    bytes: Vec<u8>,
}

/// Process-local checkpoint store
///
/// Stores encoded bytes rather than values so that loads exercise the same
/// codec and corruption checks as the filesystem store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<RunId, StoredCheckpoint>>,
    saves: AtomicU64,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored bytes of a run without any checks
    pub fn insert_raw(&self, run_id: RunId, bytes: Vec<u8>) {
        self.entries
            .write()
            .insert(run_id, StoredCheckpoint { revision: 0, bytes });
    }

    /// Number of successful saves since creation
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Number of stored checkpoints
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no checkpoints
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let bytes = encode_checkpoint(checkpoint)?;
        let mut entries = self.entries.write();
        if let Some(stored) = entries.get(&checkpoint.run_id) {
            if checkpoint.revision <= stored.revision {
                return Err(StoreError::StaleRevision {
                    run_id: checkpoint.run_id,
                    revision: checkpoint.revision,
                    stored: stored.revision,
                });
            }
        }
        entries.insert(
            checkpoint.run_id,
            StoredCheckpoint {
                revision: checkpoint.revision,
                bytes,
            },
        );
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<Checkpoint>, StoreError> {
        let bytes = match self.entries.read().get(&run_id) {
            Some(stored) => stored.bytes.clone(),
            None => return Ok(None),
        };
        decode_checkpoint(run_id, &bytes).map(Some)
    }

    async fn delete(&self, run_id: RunId) -> Result<(), StoreError> {
        self.entries.write().remove(&run_id);
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let mut runs: Vec<RunId> = self.entries.read().keys().copied().collect();
        runs.sort();
        Ok(runs)
    }
}
