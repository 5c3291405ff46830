//! Node-wide flow status table

use parking_lot::RwLock;
use std::collections::HashMap;
use strand_core::{FlowState, RunId};

/// Last known status of one flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStatus {
    /// Run
    pub run_id: RunId,
    /// Registered flow name
    pub flow_name: String,
    /// Logical state
    pub state: FlowState,
    /// Description of the pending wait while suspended
    pub pending: Option<String>,
    /// Unix milliseconds of the last transition
    pub updated_at_ms: u64,
}

/// Status of every flow the node hosts or recently hosted
#[derive(Debug, Default)]
pub struct FlowTable {
    entries: RwLock<HashMap<RunId, FlowStatus>>,
}

impl FlowTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition
    pub fn update(&self, run_id: RunId, flow_name: &str, state: FlowState, pending: Option<String>) {
        self.entries.write().insert(
            run_id,
            FlowStatus {
                run_id,
                flow_name: flow_name.to_string(),
                state,
                pending,
                updated_at_ms: strand_core::time::unix_millis(),
            },
        );
    }

    /// Status of one flow
    pub fn get(&self, run_id: RunId) -> Option<FlowStatus> {
        self.entries.read().get(&run_id).cloned()
    }

    /// Forget a flow
    pub fn remove(&self, run_id: RunId) {
        self.entries.write().remove(&run_id);
    }

    /// Flows currently in `state`
    pub fn in_state(&self, state: FlowState) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self
            .entries
            .read()
            .values()
            .filter(|status| status.state == state)
            .map(|status| status.run_id)
            .collect();
        runs.sort();
        runs
    }
}
