//! Ledger finality interface
//!
//! Finality is push-based: the ledger notifies the node when a transaction
//! commits or is rejected. `outcome` lets a resuming flow learn about a
//! signal that arrived while it was not parked.

use crate::flow::CommitOutcome;
use crate::identifiers::TxHash;
use async_trait::async_trait;

/// Query side of the ledger finality collaborator
#[async_trait]
pub trait FinalityEffects: Send + Sync {
    /// Terminal outcome of `hash`, if already known
    async fn outcome(&self, hash: &TxHash) -> Option<CommitOutcome>;
}
