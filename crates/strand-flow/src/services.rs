//! Collaborators injected into every flow on a node

use crate::finality::FinalityTracker;
use crate::table::FlowTable;
use std::sync::Arc;
use std::time::Duration;
use strand_core::{
    AuditSink, CheckpointStore, FinalityEffects, IdentityEffects, PartyName, PermissionEvaluator,
    SnapshotSink, TransportEffects,
};
use strand_session::SessionRegistry;

/// Dependency bundle shared by the flows of one node
///
/// Everything a flow touches outside its own state is reached through
/// these handles, so tests substitute any of them freely.
#[derive(Clone)]
pub struct FlowServices {
    /// Identity of the local node
    pub our_identity: PartyName,
    /// Node-wide session routes
    pub sessions: Arc<SessionRegistry>,
    /// Durable checkpoint store
    pub store: Arc<dyn CheckpointStore>,
    /// Outbound transport
    pub transport: Arc<dyn TransportEffects>,
    /// Party name resolution
    pub identity: Arc<dyn IdentityEffects>,
    /// Audit log
    pub audit: Arc<dyn AuditSink>,
    /// Permission evaluation for `check_flow_permission`
    pub permissions: Arc<dyn PermissionEvaluator>,
    /// Finality signals pushed to this node
    pub finality: Arc<FinalityTracker>,
    /// Optional ledger query for signals that predate the wait
    pub ledger: Option<Arc<dyn FinalityEffects>>,
    /// Optional sink for persisted stack snapshots
    pub snapshots: Option<Arc<dyn SnapshotSink>>,
    /// Status of every flow hosted by the node
    pub table: Arc<FlowTable>,
    /// How long terminal checkpoints are kept
    pub retention: Duration,
}

impl std::fmt::Debug for FlowServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowServices")
            .field("our_identity", &self.our_identity)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
