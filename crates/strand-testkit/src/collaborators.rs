//! Recording and scriptable collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use strand_core::{
    AuditError, AuditKind, AuditRecord, AuditSink, Checkpoint, CheckpointStore, CommitOutcome,
    FinalityEffects, RunId, StoreError, TxHash,
};
use strand_store::MemoryCheckpointStore;

/// Audit sink that keeps every record and can be switched to failing
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl RecordingAuditSink {
    /// Sink accepting every record
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every subsequent record when `failing` is set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Records accepted so far
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Permission-check records for `run_id`
    pub fn permission_checks(&self, run_id: RunId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.run_id == run_id && matches!(r.kind, AuditKind::PermissionCheck { .. }))
            .cloned()
            .collect()
    }

    /// Failure records for `run_id`
    pub fn failures(&self, run_id: RunId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.run_id == run_id && matches!(r.kind, AuditKind::FlowFailure { .. }))
            .cloned()
            .collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::new("audit sink unavailable"));
        }
        self.records.lock().push(record);
        Ok(())
    }
}

/// Checkpoint store that remembers every checkpoint it accepted
///
/// The history lets tests rebuild a store as it was at any earlier
/// revision, which is how a crash between two saves is simulated.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryCheckpointStore,
    history: Mutex<Vec<Checkpoint>>,
}

impl RecordingStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted checkpoint, oldest first
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.lock().clone()
    }

    /// Accepted checkpoints of one run, oldest first
    pub fn history_of(&self, run_id: RunId) -> Vec<Checkpoint> {
        self.history
            .lock()
            .iter()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Underlying store
    pub fn inner(&self) -> &MemoryCheckpointStore {
        &self.inner
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.inner.save(checkpoint).await?;
        self.history.lock().push(checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.load(run_id).await
    }

    async fn delete(&self, run_id: RunId) -> Result<(), StoreError> {
        self.inner.delete(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        self.inner.list_runs().await
    }
}

/// Store holding exactly `checkpoints`, as a node restarted at that point
/// would find it
pub async fn store_with(checkpoints: &[Checkpoint]) -> Result<MemoryCheckpointStore, StoreError> {
    let store = MemoryCheckpointStore::new();
    for checkpoint in checkpoints {
        store.save(checkpoint).await?;
    }
    Ok(store)
}

/// Ledger whose outcomes are set by the test
#[derive(Debug, Default)]
pub struct ScriptedLedger {
    outcomes: Mutex<HashMap<TxHash, CommitOutcome>>,
}

impl ScriptedLedger {
    /// Ledger that knows no transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hash` as committed
    pub fn commit(&self, hash: TxHash) {
        self.outcomes.lock().insert(hash, CommitOutcome::Committed);
    }

    /// Record `hash` as rejected
    pub fn reject(&self, hash: TxHash, reason: impl Into<String>) {
        self.outcomes.lock().insert(
            hash,
            CommitOutcome::Rejected {
                reason: reason.into(),
            },
        );
    }
}

#[async_trait]
impl FinalityEffects for ScriptedLedger {
    async fn outcome(&self, hash: &TxHash) -> Option<CommitOutcome> {
        self.outcomes.lock().get(hash).cloned()
    }
}
