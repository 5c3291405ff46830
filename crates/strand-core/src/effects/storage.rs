//! Checkpoint persistence interfaces

use crate::errors::FlowError;
use crate::flow::{Checkpoint, FlowStackSnapshot};
use crate::identifiers::RunId;
use async_trait::async_trait;

/// Checkpoint store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The stored bytes for a run do not decode to a valid checkpoint
    #[error("Corrupt checkpoint for {run_id}: {reason}")]
    Corrupt {
        /// Affected run
        run_id: RunId,
        /// Decoding failure
        reason: String,
    },
    /// A save carried a revision not newer than the stored one
    #[error("Stale checkpoint for {run_id}: revision {revision} <= stored {stored}")]
    StaleRevision {
        /// Affected run
        run_id: RunId,
        /// Revision offered
        revision: u64,
        /// Revision already stored
        stored: u64,
    },
    /// Underlying I/O failure
    #[error("Checkpoint store I/O error: {reason}")]
    Io {
        /// Reason for the failure
        reason: String,
    },
}

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { run_id, reason } => FlowError::corruption(run_id, reason),
            other => FlowError::storage(other.to_string()),
        }
    }
}

/// Durable, atomic checkpoint store keyed by run id
///
/// A successful `save` must be durable before it returns, and replaces the
/// previous checkpoint of the run atomically: a crash leaves either the old
/// or the new checkpoint, never a mix.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, superseding the stored one
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Load the latest checkpoint of a run
    async fn load(&self, run_id: RunId) -> Result<Option<Checkpoint>, StoreError>;

    /// Remove the checkpoint of a run; missing runs are not an error
    async fn delete(&self, run_id: RunId) -> Result<(), StoreError>;

    /// Every run with a stored checkpoint
    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError>;
}

/// Destination for diagnostic flow stack snapshots
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Persist one snapshot
    async fn persist(&self, snapshot: &FlowStackSnapshot) -> Result<(), StoreError>;
}
