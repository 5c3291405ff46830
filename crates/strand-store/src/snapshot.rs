//! Flow stack snapshot sinks
//!
//! Snapshots are diagnostic only. The filesystem sink lays them out as
//! `flowStackSnapshots/<YYYY-MM-DD>/<run id>/flowStackSnapshot[-N].json`
//! so repeated captures of one flow on one day never overwrite each other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use strand_core::time::utc_date;
use strand_core::{FlowStackSnapshot, SnapshotSink, StoreError};
use tokio::fs;

const SNAPSHOT_DIR: &str = "flowStackSnapshots";
const SNAPSHOT_FILE: &str = "flowStackSnapshot";

/// Writes snapshots as pretty-printed JSON under a base directory
#[derive(Debug, Clone)]
pub struct FilesystemSnapshotSink {
    base_path: PathBuf,
}

impl FilesystemSnapshotSink {
    /// Create a sink rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn snapshot_dir(&self, snapshot: &FlowStackSnapshot) -> PathBuf {
        self.base_path
            .join(SNAPSHOT_DIR)
            .join(utc_date(snapshot.captured_at_ms))
            .join(snapshot.run_id.to_string())
    }
}

#[async_trait]
impl SnapshotSink for FilesystemSnapshotSink {
    async fn persist(&self, snapshot: &FlowStackSnapshot) -> Result<(), StoreError> {
        let dir = self.snapshot_dir(snapshot);
        fs::create_dir_all(&dir).await.map_err(|e| StoreError::Io {
            reason: format!("create snapshot directory: {e}"),
        })?;

        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| StoreError::Io {
            reason: format!("encode snapshot: {e}"),
        })?;

        let mut path = dir.join(format!("{SNAPSHOT_FILE}.json"));
        let mut suffix = 1u32;
        while fs::try_exists(&path).await.unwrap_or(false) {
            path = dir.join(format!("{SNAPSHOT_FILE}-{suffix}.json"));
            suffix += 1;
        }

        fs::write(&path, json).await.map_err(|e| StoreError::Io {
            reason: format!("write snapshot: {e}"),
        })?;
        tracing::debug!(run_id = %snapshot.run_id, path = %path.display(), "Flow stack snapshot written");
        Ok(())
    }
}

/// Keeps snapshots in memory
#[derive(Debug, Default)]
pub struct MemorySnapshotSink {
    snapshots: Mutex<Vec<FlowStackSnapshot>>,
}

impl MemorySnapshotSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot persisted so far
    pub fn snapshots(&self) -> Vec<FlowStackSnapshot> {
        self.snapshots.lock().clone()
    }
}

#[async_trait]
impl SnapshotSink for MemorySnapshotSink {
    async fn persist(&self, snapshot: &FlowStackSnapshot) -> Result<(), StoreError> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}
