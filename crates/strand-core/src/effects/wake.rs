//! Scheduler wake-up interface

use crate::identifiers::RunId;

/// Notifies the scheduler that a parked flow may make progress
///
/// Wakes are hints: waking a flow that is not parked, or waking it twice,
/// must be harmless.
pub trait FlowWaker: Send + Sync {
    /// Request a resume attempt for `run_id`
    fn wake(&self, run_id: RunId);
}
