//! Recovery of in-flight flows after a restart
//!
//! Every checkpoint in the store is inspected independently. In-flight
//! flows are rebuilt with their pending wait re-armed and their unflushed
//! sends replayed; one broken checkpoint never prevents the others from
//! resuming.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strand_core::{Checkpoint, FlowError, FlowState, RunId, StoreError, TerminalOutcome};
use strand_flow::{result_channel, FlowHandle, FlowRegistry, FlowServices, FlowStateMachine};

/// Flow name recorded for checkpoints that could not be read at all
const UNREADABLE_FLOW: &str = "<unreadable>";

/// What recovery did with each checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// In-flight flows rebuilt and handed to the scheduler
    pub resumed: Vec<RunId>,
    /// Flows marked failed, with the cause
    pub failed: Vec<(RunId, FlowError)>,
    /// Terminal checkpoints whose retention window had elapsed; deleted
    pub expired: Vec<RunId>,
    /// Terminal checkpoints still inside their retention window
    pub retained: Vec<RunId>,
}

impl RecoveryReport {
    /// Runs whose checkpoint could not be rehydrated
    pub fn corrupt(&self) -> Vec<RunId> {
        self.failed
            .iter()
            .filter(|(_, e)| matches!(e, FlowError::CheckpointCorruption { .. }))
            .map(|(run_id, _)| *run_id)
            .collect()
    }

    /// Number of checkpoints inspected
    pub fn total(&self) -> usize {
        self.resumed.len() + self.failed.len() + self.expired.len() + self.retained.len()
    }
}

/// Output of a recovery pass, ready to be handed to the node
pub(crate) struct Recovered {
    pub report: RecoveryReport,
    pub machines: Vec<FlowStateMachine>,
    pub handles: Vec<FlowHandle>,
    /// Retained terminal checkpoints and the rest of their window
    pub windows: Vec<(RunId, Duration)>,
}

/// Rebuilds flows from the checkpoint store
pub(crate) struct RecoveryManager<'a> {
    registry: &'a FlowRegistry,
    services: &'a Arc<FlowServices>,
    live: HashSet<RunId>,
}

impl<'a> RecoveryManager<'a> {
    /// Create a manager over the node's registry and services
    pub(crate) fn new(registry: &'a FlowRegistry, services: &'a Arc<FlowServices>) -> Self {
        Self {
            registry,
            services,
            live: HashSet::new(),
        }
    }

    /// Leave checkpoints of runs already executing on this node untouched
    pub(crate) fn skipping(mut self, live: impl IntoIterator<Item = RunId>) -> Self {
        self.live.extend(live);
        self
    }

    /// Inspect every stored checkpoint
    ///
    /// Fails only when the store cannot list its runs.
    pub(crate) async fn recover(&self) -> Result<Recovered, StoreError> {
        let runs = self.services.store.list_runs().await?;
        tracing::info!(checkpoints = runs.len(), "Recovering flows from checkpoints");

        let mut recovered = Recovered {
            report: RecoveryReport::default(),
            machines: Vec::new(),
            handles: Vec::new(),
            windows: Vec::new(),
        };
        for run_id in runs {
            self.recover_run(run_id, &mut recovered).await;
        }
        Ok(recovered)
    }

    async fn recover_run(&self, run_id: RunId, out: &mut Recovered) {
        if self.live.contains(&run_id) {
            tracing::debug!(%run_id, "Run is live; skipping its checkpoint");
            return;
        }
        let checkpoint = match self.services.store.load(run_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                tracing::debug!(%run_id, "Checkpoint vanished during recovery");
                return;
            }
            Err(e) => {
                self.quarantine(run_id, UNREADABLE_FLOW, FlowError::from(e), out);
                return;
            }
        };

        if checkpoint.is_terminal() {
            self.apply_retention(checkpoint, out).await;
            return;
        }

        let logic = match self
            .registry
            .decode(&checkpoint.flow_name, &checkpoint.logic_state)
        {
            Ok(logic) => logic,
            Err(e) => {
                let error = FlowError::corruption(run_id, format!("{}: {e}", checkpoint.flow_name));
                self.quarantine(run_id, &checkpoint.flow_name, error, out);
                return;
            }
        };

        let (slot, handle) = result_channel(run_id);
        let mut machine =
            FlowStateMachine::restore(checkpoint, logic, self.services.clone(), slot);
        out.handles.push(handle);
        match machine.replay_outbound().await {
            Ok(()) => {
                tracing::info!(
                    %run_id,
                    flow = machine.flow_name(),
                    pending = machine.pending().map(|p| p.describe()).unwrap_or_default(),
                    "Flow recovered"
                );
                out.report.resumed.push(run_id);
                out.machines.push(machine);
            }
            Err(e) => {
                machine.abort(e.clone()).await;
                out.report.failed.push((run_id, e));
            }
        }
    }

    /// Mark a run failed without touching its checkpoint
    ///
    /// The bytes stay in the store for inspection; recovery reports the run
    /// again on every start until an operator removes it.
    fn quarantine(&self, run_id: RunId, flow_name: &str, error: FlowError, out: &mut Recovered) {
        tracing::error!(%run_id, flow = flow_name, error = %error, "Checkpoint cannot be resumed; left in place");
        self.services
            .table
            .update(run_id, flow_name, FlowState::Failed, None);
        out.handles
            .push(FlowHandle::resolved(run_id, Err(error.clone())));
        out.report.failed.push((run_id, error));
    }

    async fn apply_retention(&self, checkpoint: Checkpoint, out: &mut Recovered) {
        let run_id = checkpoint.run_id;
        let retention = self.services.retention;
        let age = Duration::from_millis(
            strand_core::time::unix_millis().saturating_sub(checkpoint.checkpointed_at_ms),
        );

        if age >= retention {
            match self.services.store.delete(run_id).await {
                Ok(()) => {
                    tracing::debug!(%run_id, "Expired terminal checkpoint deleted");
                    out.report.expired.push(run_id);
                }
                Err(e) => {
                    tracing::warn!(%run_id, error = %e, "Failed to delete expired checkpoint");
                }
            }
            return;
        }

        let outcome = match checkpoint.outcome {
            Some(TerminalOutcome::Completed(output)) => Ok(output),
            Some(TerminalOutcome::Failed(error)) => Err(error),
            None => Err(FlowError::corruption(run_id, "terminal checkpoint without outcome")),
        };
        self.services
            .table
            .update(run_id, &checkpoint.flow_name, checkpoint.state, None);
        out.handles.push(FlowHandle::resolved(run_id, outcome));
        out.windows.push((run_id, retention - age));
        out.report.retained.push(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LoggingAuditSink, PermissionTable, StaticIdentity};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use strand_core::{
        CheckpointStore, Envelope, FlowInitiator, FlowResult, NetworkIdentity, PartyName,
        Payload, TransportEffects, TransportError, TxHash,
    };
    use strand_flow::{FinalityTracker, FlowContext, FlowLogic, FlowTable, Resume, Step, Wait};
    use strand_session::SessionRegistry;
    use strand_store::MemoryCheckpointStore;

    struct Discard;

    #[async_trait]
    impl TransportEffects for Discard {
        async fn send_envelope(
            &self,
            _to: &NetworkIdentity,
            _envelope: Envelope,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Idle {
        hash: TxHash,
    }

    impl FlowLogic for Idle {
        const NAME: &'static str = "test.idle";
        type Output = ();

        fn step(&mut self, _ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<()>> {
            match resume {
                Resume::Start => Ok(Step::Await(Wait::ledger_commit(self.hash))),
                other => other.committed().map(|_| Step::Done(())),
            }
        }
    }

    fn services(store: Arc<MemoryCheckpointStore>, retention: Duration) -> Arc<FlowServices> {
        Arc::new(FlowServices {
            our_identity: PartyName::new("O=Bank A"),
            sessions: Arc::new(SessionRegistry::new()),
            store,
            transport: Arc::new(Discard),
            identity: Arc::new(StaticIdentity::new()),
            audit: Arc::new(LoggingAuditSink),
            permissions: Arc::new(PermissionTable::new()),
            finality: Arc::new(FinalityTracker::new()),
            ledger: None,
            snapshots: None,
            table: Arc::new(FlowTable::new()),
            retention,
        })
    }

    async fn suspended_idle(services: &Arc<FlowServices>) -> RunId {
        let run_id = RunId::new();
        let (slot, _handle) = result_channel(run_id);
        let mut machine = FlowStateMachine::new(
            run_id,
            Box::new(Idle {
                hash: TxHash::of(b"tx"),
            }),
            FlowInitiator::rpc("alice"),
            services.clone(),
            slot,
        );
        machine.start().await.unwrap();
        machine.activate().await.unwrap();
        run_id
    }

    fn registry() -> FlowRegistry {
        let mut registry = FlowRegistry::new();
        registry.register::<Idle>();
        registry
    }

    #[tokio::test]
    async fn corrupt_checkpoint_does_not_block_others() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let before = services(store.clone(), Duration::ZERO);
        let healthy = suspended_idle(&before).await;
        let broken = RunId::new();
        store.insert_raw(broken, b"not a checkpoint".to_vec());

        let after = services(store.clone(), Duration::ZERO);
        let registry = registry();
        let recovered = RecoveryManager::new(&registry, &after).recover().await.unwrap();

        assert_eq!(recovered.report.resumed, vec![healthy]);
        assert_eq!(recovered.report.corrupt(), vec![broken]);
        assert_eq!(recovered.machines.len(), 1);
        assert_eq!(
            after.table.get(broken).map(|s| s.state),
            Some(FlowState::Failed)
        );
        let broken_handle = recovered
            .handles
            .iter()
            .find(|h| h.run_id() == broken)
            .unwrap();
        assert!(matches!(
            broken_handle.try_result(),
            Some(Err(FlowError::CheckpointCorruption { .. }))
        ));
        // Left on disk for inspection.
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn unknown_flow_name_counts_as_corruption() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let run_id = suspended_idle(&services(store.clone(), Duration::ZERO)).await;

        let after = services(store, Duration::ZERO);
        let empty = FlowRegistry::new();
        let recovered = RecoveryManager::new(&empty, &after).recover().await.unwrap();
        assert_eq!(recovered.report.corrupt(), vec![run_id]);
        assert!(recovered.report.resumed.is_empty());
    }

    #[tokio::test]
    async fn terminal_checkpoints_follow_retention() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let services = services(store.clone(), Duration::from_secs(3600));

        let finished = terminal(RunId::new(), 0);
        store.save(&finished).await.unwrap();
        let fresh = terminal(RunId::new(), strand_core::time::unix_millis());
        store.save(&fresh).await.unwrap();

        let registry = registry();
        let recovered = RecoveryManager::new(&registry, &services).recover().await.unwrap();
        assert_eq!(recovered.report.expired, vec![finished.run_id]);
        assert_eq!(recovered.report.retained, vec![fresh.run_id]);
        assert!(store.load(finished.run_id).await.unwrap().is_none());

        let handle = recovered.handles.first().unwrap();
        assert_eq!(handle.run_id(), fresh.run_id);
        assert!(matches!(handle.try_result(), Some(Ok(_))));
        assert!(recovered.windows[0].1 <= Duration::from_secs(3600));
    }

    fn terminal(run_id: RunId, at_ms: u64) -> Checkpoint {
        Checkpoint {
            run_id,
            revision: 1,
            flow_name: Idle::NAME.to_string(),
            protocol: strand_core::ProtocolDescriptor::new(Idle::NAME, 1),
            initiator: FlowInitiator::rpc("alice"),
            state: FlowState::Completed,
            logic_state: Vec::new(),
            sessions: Vec::new(),
            pending: None,
            outbox: Vec::new(),
            retry_send: None,
            outcome: Some(TerminalOutcome::Completed(Payload::encode(&()).unwrap())),
            trail: Vec::new(),
            created_at_ms: at_ms,
            checkpointed_at_ms: at_ms,
        }
    }
}
