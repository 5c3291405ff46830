//! Filesystem checkpoint store
//!
//! One file per run under the base directory, named `<uuid>.ckpt`. Saves
//! write a sibling `.tmp` file, fsync it and rename it over the previous
//! checkpoint, so a crash leaves either the old or the new checkpoint.

use crate::codec::{decode_checkpoint, encode_checkpoint};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use strand_core::{Checkpoint, CheckpointStore, RunId, StoreError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const CHECKPOINT_EXT: &str = "ckpt";
const TEMP_EXT: &str = "tmp";

fn io_error(context: &str, err: std::io::Error) -> StoreError {
    StoreError::Io {
        reason: format!("{context}: {err}"),
    }
}

/// Filesystem checkpoint store for production use
#[derive(Debug)]
pub struct FilesystemCheckpointStore {
    base_path: PathBuf,
    revisions: Mutex<HashMap<RunId, u64>>,
}

impl FilesystemCheckpointStore {
    /// Open (creating if needed) a store rooted at `base_path`
    ///
    /// Leftover temp files from an interrupted save are removed.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .await
            .map_err(|e| io_error("create checkpoint directory", e))?;

        let mut read_dir = fs::read_dir(&base_path)
            .await
            .map_err(|e| io_error("read checkpoint directory", e))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| io_error("read checkpoint directory entry", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(TEMP_EXT) {
                tracing::debug!(path = %path.display(), "Removing interrupted checkpoint write");
                fs::remove_file(&path)
                    .await
                    .map_err(|e| io_error("remove temp checkpoint", e))?;
            }
        }

        Ok(Self {
            base_path,
            revisions: Mutex::new(HashMap::new()),
        })
    }

    /// Directory the store writes to
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn checkpoint_path(&self, run_id: RunId) -> PathBuf {
        self.base_path
            .join(format!("{}.{CHECKPOINT_EXT}", run_id.uuid()))
    }

    fn temp_path(&self, run_id: RunId) -> PathBuf {
        self.base_path
            .join(format!("{}.{CHECKPOINT_EXT}.{TEMP_EXT}", run_id.uuid()))
    }

    async fn read_bytes(&self, run_id: RunId) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.checkpoint_path(run_id)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read checkpoint", e)),
        }
    }

    /// Revision currently on disk; unreadable or corrupt files count as 0 so
    /// they can be overwritten
    async fn stored_revision(&self, run_id: RunId) -> Result<Option<u64>, StoreError> {
        if let Some(revision) = self.revisions.lock().get(&run_id).copied() {
            return Ok(Some(revision));
        }
        let Some(bytes) = self.read_bytes(run_id).await? else {
            return Ok(None);
        };
        let revision = decode_checkpoint(run_id, &bytes)
            .map(|checkpoint| checkpoint.revision)
            .unwrap_or(0);
        self.revisions.lock().insert(run_id, revision);
        Ok(Some(revision))
    }
}

#[async_trait]
impl CheckpointStore for FilesystemCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let run_id = checkpoint.run_id;
        if let Some(stored) = self.stored_revision(run_id).await? {
            if checkpoint.revision <= stored {
                return Err(StoreError::StaleRevision {
                    run_id,
                    revision: checkpoint.revision,
                    stored,
                });
            }
        }

        let bytes = encode_checkpoint(checkpoint)?;
        let temp = self.temp_path(run_id);
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| io_error("create temp checkpoint", e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| io_error("write temp checkpoint", e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("sync temp checkpoint", e))?;
        drop(file);

        fs::rename(&temp, self.checkpoint_path(run_id))
            .await
            .map_err(|e| io_error("replace checkpoint", e))?;
        // Persist the rename itself; not every platform can open directories.
        if let Ok(dir) = fs::File::open(&self.base_path).await {
            if let Err(e) = dir.sync_all().await {
                tracing::debug!(error = %e, "Checkpoint directory sync failed");
            }
        }

        self.revisions.lock().insert(run_id, checkpoint.revision);
        tracing::trace!(%run_id, revision = checkpoint.revision, "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<Checkpoint>, StoreError> {
        match self.read_bytes(run_id).await? {
            Some(bytes) => decode_checkpoint(run_id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, run_id: RunId) -> Result<(), StoreError> {
        self.revisions.lock().remove(&run_id);
        match fs::remove_file(self.checkpoint_path(run_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete checkpoint", e)),
        }
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let mut runs = Vec::new();
        let mut read_dir = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| io_error("read checkpoint directory", e))?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| io_error("read checkpoint directory entry", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match Uuid::parse_str(stem) {
                Ok(uuid) => runs.push(RunId::from_uuid(uuid)),
                Err(_) => {
                    tracing::warn!(path = %path.display(), "Ignoring unrecognised checkpoint file");
                }
            }
        }

        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::checkpoint;

    #[tokio::test]
    async fn save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCheckpointStore::open(dir.path()).await.unwrap();
        let run_id = RunId::new();

        store.save(&checkpoint(run_id, 1)).await.unwrap();
        store.save(&checkpoint(run_id, 2)).await.unwrap();
        let loaded = store.load(run_id).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint(run_id, 2));
        assert_eq!(store.list_runs().await.unwrap(), vec![run_id]);

        store.delete(run_id).await.unwrap();
        assert!(store.load(run_id).await.unwrap().is_none());
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revision_guard_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        {
            let store = FilesystemCheckpointStore::open(dir.path()).await.unwrap();
            store.save(&checkpoint(run_id, 5)).await.unwrap();
        }
        let store = FilesystemCheckpointStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.save(&checkpoint(run_id, 4)).await,
            Err(StoreError::StaleRevision { stored: 5, .. })
        ));
        store.save(&checkpoint(run_id, 6)).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCheckpointStore::open(dir.path()).await.unwrap();
        let run_id = RunId::new();
        std::fs::write(
            dir.path().join(format!("{}.ckpt", run_id.uuid())),
            b"not a checkpoint",
        )
        .unwrap();

        assert!(matches!(
            store.load(run_id).await,
            Err(StoreError::Corrupt { .. })
        ));
        // Corrupt files can be replaced by any revision.
        store.save(&checkpoint(run_id, 1)).await.unwrap();
        assert!(store.load(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn open_clears_interrupted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join(format!("{}.ckpt.tmp", Uuid::new_v4()));
        std::fs::write(&leftover, b"partial").unwrap();

        let store = FilesystemCheckpointStore::open(dir.path()).await.unwrap();
        assert!(!leftover.exists());
        assert!(store.list_runs().await.unwrap().is_empty());
    }
}
