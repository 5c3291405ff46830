//! Flow node
//!
//! The node ties the pieces together: it owns the collaborator bundle, the
//! flow registry and the scheduler, starts flows on request, accepts
//! inbound session requests for registered responders, routes inbound
//! envelopes and ledger signals to the flows waiting on them, and runs
//! recovery at startup.
//!
//! # Usage
//!
//! ```rust,ignore
//! let node = FlowNodeBuilder::new(NodeConfig::load(Some(path))?)
//!     .with_transport(transport)
//!     .register::<IssueFlow>()
//!     .register_responder::<IssueResponder>()
//!     .build()
//!     .await?;
//! node.recover().await?;
//! let handle = node.start_flow(IssueFlow::new(counterparty), FlowInitiator::rpc("alice")).await?;
//! let receipt: Receipt = handle.result_as().await?;
//! ```

use crate::collaborators::{LoggingAuditSink, PermissionTable, StaticIdentity};
use crate::config::{ConfigError, NodeConfig};
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::task_registry::TaskRegistry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_core::{
    AuditSink, CheckpointStore, CommitOutcome, Envelope, EnvelopeHandler, FinalityEffects,
    FlowError, FlowInitiator, FlowResult, FlowState, FlowWaker, IdentityEffects, PartyName,
    PermissionEvaluator, RejectReason, RunId, SessionId, SessionMessage, SessionRole,
    SnapshotSink, StoreError, TransportEffects, TxHash,
};
use strand_flow::{
    result_channel, FinalityTracker, FlowHandle, FlowLogic, FlowRegistry, FlowServices,
    FlowStateMachine, FlowStatus, FlowTable, ResponderFlow, SessionRef,
};
use strand_session::{DeliveryOutcome, RegistryStats, SessionRegistry};
use strand_store::{FilesystemCheckpointStore, FilesystemSnapshotSink, MemoryCheckpointStore};

/// Address recorded for the node's own identity in the default address book
const LOCAL_ADDRESS: &str = "local";

/// Node construction failures
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Configuration was rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The configured checkpoint store could not be opened
    #[error("Checkpoint store unavailable: {0}")]
    Store(#[from] StoreError),

    /// A collaborator without a default was not supplied
    #[error("No {collaborator} configured")]
    Missing {
        /// Collaborator name
        collaborator: &'static str,
    },
}

/// Builder for a [`FlowNode`]
pub struct FlowNodeBuilder {
    config: NodeConfig,
    registry: FlowRegistry,
    store: Option<Arc<dyn CheckpointStore>>,
    transport: Option<Arc<dyn TransportEffects>>,
    identity: Option<Arc<dyn IdentityEffects>>,
    audit: Option<Arc<dyn AuditSink>>,
    permissions: Option<Arc<dyn PermissionEvaluator>>,
    ledger: Option<Arc<dyn FinalityEffects>>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl FlowNodeBuilder {
    /// Start from a loaded configuration
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            registry: FlowRegistry::new(),
            store: None,
            transport: None,
            identity: None,
            audit: None,
            permissions: None,
            ledger: None,
            snapshots: None,
        }
    }

    /// Start from defaults with the given identity
    pub fn with_identity_name(identity: impl Into<String>) -> Self {
        let mut config = NodeConfig::default();
        config.node.identity = identity.into();
        Self::new(config)
    }

    /// Make `F` startable and recoverable
    pub fn register<F: FlowLogic>(mut self) -> Self {
        self.registry.register::<F>();
        self
    }

    /// Register `F` as the responder for its protocol
    pub fn register_responder<F: ResponderFlow>(mut self) -> Self {
        self.registry.register_responder::<F>();
        self
    }

    /// Use `store` instead of the configured one
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Outbound transport (required)
    pub fn with_transport(mut self, transport: Arc<dyn TransportEffects>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use `identity` instead of the `[peers]` address book
    pub fn with_identity(mut self, identity: Arc<dyn IdentityEffects>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use `audit` instead of the logging sink
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Use `permissions` instead of the `[permissions]` table
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionEvaluator>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Ledger query consulted when a flow starts waiting on a transaction
    pub fn with_ledger(mut self, ledger: Arc<dyn FinalityEffects>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Use `snapshots` instead of the configured snapshot directory
    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Override the retention window of terminal checkpoints
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.config.checkpoints.retention_secs = retention.as_secs();
        self
    }

    /// Override the worker bound
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.config.scheduler.max_workers = max_workers;
        self
    }

    /// Override the pause before refused envelopes are handed off again
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.config.scheduler.redelivery_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Validate the configuration and assemble the node
    pub async fn build(self) -> Result<Arc<FlowNode>, NodeError> {
        let config = self.config;
        config.validate()?;

        let transport = self.transport.ok_or(NodeError::Missing {
            collaborator: "transport",
        })?;
        let store: Arc<dyn CheckpointStore> = match (self.store, &config.checkpoints.directory) {
            (Some(store), _) => store,
            (None, Some(directory)) => Arc::new(FilesystemCheckpointStore::open(directory).await?),
            (None, None) => Arc::new(MemoryCheckpointStore::new()),
        };
        let snapshots: Option<Arc<dyn SnapshotSink>> = match self.snapshots {
            Some(sink) => Some(sink),
            None => config
                .snapshots
                .directory
                .as_ref()
                .map(|dir| Arc::new(FilesystemSnapshotSink::new(dir)) as Arc<dyn SnapshotSink>),
        };

        let our_identity = PartyName::new(config.node.identity.clone());
        let identity = self.identity.unwrap_or_else(|| {
            Arc::new(
                StaticIdentity::from_config(&config.peers)
                    .with_peer(our_identity.clone(), LOCAL_ADDRESS),
            )
        });
        let audit = self.audit.unwrap_or_else(|| Arc::new(LoggingAuditSink));
        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(PermissionTable::from_config(&config.permissions)));

        let retention = config.checkpoints.retention();
        let services = Arc::new(FlowServices {
            our_identity: our_identity.clone(),
            sessions: Arc::new(SessionRegistry::new()),
            store: store.clone(),
            transport,
            identity,
            audit,
            permissions,
            finality: Arc::new(FinalityTracker::new()),
            ledger: self.ledger,
            snapshots,
            table: Arc::new(FlowTable::new()),
            retention,
        });
        let tasks = Arc::new(TaskRegistry::new());
        let scheduler = Scheduler::new(
            config.scheduler.max_workers,
            tasks.clone(),
            store,
            retention,
        )
        .with_redelivery_delay(config.scheduler.redelivery());

        tracing::info!(
            identity = %our_identity,
            max_workers = config.scheduler.max_workers,
            retention_secs = retention.as_secs(),
            flows = ?self.registry,
            "Flow node built"
        );
        Ok(Arc::new(FlowNode {
            services,
            registry: Arc::new(self.registry),
            scheduler,
            tasks,
            handles: RwLock::new(HashMap::new()),
            recovered: AtomicBool::new(false),
        }))
    }
}

/// A node hosting durable flows
pub struct FlowNode {
    services: Arc<FlowServices>,
    registry: Arc<FlowRegistry>,
    scheduler: Scheduler,
    tasks: Arc<TaskRegistry>,
    handles: RwLock<HashMap<RunId, FlowHandle>>,
    recovered: AtomicBool,
}

impl FlowNode {
    /// Identity the node acts as
    pub fn identity(&self) -> &PartyName {
        &self.services.our_identity
    }

    /// Start a new flow
    ///
    /// The flow's first checkpoint is durable when this returns. The
    /// returned handle resolves once with the flow's output or failure.
    pub async fn start_flow<F: FlowLogic>(
        &self,
        logic: F,
        initiator: FlowInitiator,
    ) -> FlowResult<FlowHandle> {
        if !self.registry.contains(F::NAME) {
            return Err(FlowError::internal(format!(
                "flow {} is not registered on this node",
                F::NAME
            )));
        }
        if self.tasks.is_shut_down() {
            return Err(FlowError::internal("node is shut down"));
        }

        let run_id = RunId::new();
        let (slot, handle) = result_channel(run_id);
        let mut machine = FlowStateMachine::new(
            run_id,
            Box::new(logic),
            initiator,
            self.services.clone(),
            slot,
        );
        machine.start().await?;
        self.track(handle.clone());
        self.scheduler.submit(machine);
        Ok(handle)
    }

    fn track(&self, handle: FlowHandle) {
        let mut handles = self.handles.write();
        handles.retain(|_, h| h.try_result().is_none());
        handles.insert(handle.run_id(), handle);
    }

    /// Rebuild flows from the checkpoint store and hand them to the
    /// scheduler
    ///
    /// Runs once per node. Checkpoints of flows already running here are
    /// skipped; a second call fails without touching live flows, as does a
    /// call after shutdown.
    pub async fn recover(&self) -> FlowResult<RecoveryReport> {
        if self.tasks.is_shut_down() {
            return Err(FlowError::internal("node is shut down"));
        }
        if self.recovered.swap(true, Ordering::SeqCst) {
            tracing::warn!(identity = %self.services.our_identity, "Recovery already ran; ignoring");
            return Err(FlowError::internal("recovery already ran on this node"));
        }
        let live: Vec<RunId> = self
            .handles
            .read()
            .values()
            .filter(|h| h.try_result().is_none())
            .map(FlowHandle::run_id)
            .collect();
        let recovered = RecoveryManager::new(&self.registry, &self.services)
            .skipping(live)
            .recover()
            .await?;

        {
            let mut handles = self.handles.write();
            for handle in recovered.handles {
                handles.insert(handle.run_id(), handle);
            }
        }
        for (run_id, remaining) in recovered.windows {
            self.scheduler.expire_after(run_id, remaining);
        }
        for machine in recovered.machines {
            self.scheduler.submit(machine);
        }

        let report = recovered.report;
        tracing::info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            expired = report.expired.len(),
            retained = report.retained.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Ledger finality signal for `hash`
    ///
    /// The first signal for a hash is authoritative. Flows waiting on it are
    /// woken; flows that start waiting later see the recorded outcome.
    pub fn notify_commit(&self, hash: TxHash, outcome: CommitOutcome) {
        let waiters = self.services.finality.notify(hash, outcome);
        tracing::info!(%hash, waiters = waiters.len(), "Ledger finality signal");
        for run_id in waiters {
            self.scheduler.wake(run_id);
        }
    }

    /// Result handle of a flow started or recovered by this node
    pub fn flow_handle(&self, run_id: RunId) -> Option<FlowHandle> {
        self.handles.read().get(&run_id).cloned()
    }

    /// Last known status of a flow
    pub fn flow_status(&self, run_id: RunId) -> Option<FlowStatus> {
        self.services.table.get(run_id)
    }

    /// Flows currently in `state`
    pub fn flows_in_state(&self, state: FlowState) -> Vec<RunId> {
        self.services.table.in_state(state)
    }

    /// Session delivery counters
    pub fn session_stats(&self) -> RegistryStats {
        self.services.sessions.stats()
    }

    /// Worker pool occupancy
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Stop the node
    ///
    /// Running and parked flows are dropped without touching their
    /// checkpoints; their handles resolve with
    /// [`FlowError::Abandoned`] and they resume on the next
    /// [`recover`](Self::recover).
    pub fn shutdown(&self) {
        let parked = self.scheduler.close();
        self.tasks.shutdown();
        tracing::info!(identity = %self.services.our_identity, parked, "Flow node shut down");
    }

    async fn accept_session_request(
        &self,
        session_id: SessionId,
        sender: PartyName,
        protocol: String,
        version: u32,
        sequence: u64,
    ) {
        let Some(responder) = self.registry.responder(&protocol).cloned() else {
            tracing::warn!(session = %session_id, %sender, %protocol, "No responder registered; rejecting session");
            self.reject(session_id, &sender, RejectReason::UnknownProtocol { protocol })
                .await;
            return;
        };
        let negotiated = match responder.protocol.negotiate(version) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::warn!(session = %session_id, %sender, error = %e, "Rejecting session");
                self.reject(
                    session_id,
                    &sender,
                    RejectReason::IncompatibleVersion {
                        local: responder.protocol.version,
                        remote: version,
                    },
                )
                .await;
                return;
            }
        };

        let run_id = RunId::new();
        let logic = responder.instantiate(SessionRef(session_id), sender.clone());
        let (slot, handle) = result_channel(run_id);
        let mut machine = FlowStateMachine::new(
            run_id,
            logic,
            FlowInitiator::Peer {
                party: sender.clone(),
                session: session_id,
            },
            self.services.clone(),
            slot,
        );
        machine.accept_session(
            session_id,
            sender.clone(),
            responder.protocol.clone(),
            negotiated,
            sequence,
        );
        tracing::info!(
            %run_id,
            session = %session_id,
            %sender,
            flow = responder.flow_name,
            version = negotiated,
            "Session request accepted"
        );
        if let Err(e) = machine.start().await {
            tracing::warn!(%run_id, error = %e, "Responder flow failed to start");
            return;
        }
        self.track(handle);
        self.scheduler.submit(machine);
    }

    async fn reject(&self, session_id: SessionId, to: &PartyName, reason: RejectReason) {
        self.services.sessions.decline_request(session_id);
        let envelope = Envelope {
            sender: self.services.our_identity.clone(),
            session_id,
            recipient_role: SessionRole::Initiator,
            sequence: 1,
            message: SessionMessage::Reject { reason },
        };
        let sent = match self.services.identity.resolve(to) {
            Ok(destination) => self
                .services
                .transport
                .send_envelope(&destination, envelope)
                .await
                .map_err(FlowError::from),
            Err(e) => Err(FlowError::from(e)),
        };
        if let Err(e) = sent {
            tracing::warn!(session = %session_id, %to, error = %e, "Failed to send session rejection");
        }
    }
}

#[async_trait]
impl EnvelopeHandler for FlowNode {
    async fn deliver(&self, envelope: Envelope) {
        tracing::trace!(
            from = %envelope.sender,
            session = %envelope.session_id,
            sequence = envelope.sequence,
            kind = envelope.message.kind(),
            "Envelope received"
        );
        match self.services.sessions.deliver(&envelope) {
            DeliveryOutcome::SessionRequest {
                session_id,
                sender,
                protocol,
                version,
                sequence,
            } => {
                self.accept_session_request(session_id, sender, protocol, version, sequence)
                    .await;
            }
            outcome => {
                if let Some(run_id) = outcome.wake_target() {
                    self.scheduler.wake(run_id);
                }
            }
        }
    }
}

impl std::fmt::Debug for FlowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowNode")
            .field("identity", &self.services.our_identity)
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use strand_core::{NetworkIdentity, TransportError};
    use strand_flow::{FlowContext, Resume, Step, Wait};

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
    struct Settle {
        hash: TxHash,
        armed: bool,
    }

    impl FlowLogic for Settle {
        const NAME: &'static str = "test.settle";
        type Output = String;

        fn step(&mut self, _ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<String>> {
            if !self.armed {
                self.armed = true;
                return Ok(Step::Await(Wait::ledger_commit(self.hash)));
            }
            Ok(Step::Done(resume.committed()?.to_hex()))
        }
    }

    async fn node() -> Arc<FlowNode> {
        FlowNodeBuilder::with_identity_name("O=Bank A")
            .with_transport(Arc::new(Discard))
            .register::<Settle>()
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn build_requires_transport() {
        let err = FlowNodeBuilder::new(NodeConfig::default()).build().await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Missing {
                collaborator: "transport"
            }
        ));
    }

    #[tokio::test]
    async fn unregistered_flow_is_refused() {
        let node = FlowNodeBuilder::with_identity_name("O=Bank A")
            .with_transport(Arc::new(Discard))
            .build()
            .await
            .unwrap();
        let refused = node
            .start_flow(
                Settle {
                    hash: TxHash::of(b"tx"),
                    armed: false,
                },
                FlowInitiator::rpc("alice"),
            )
            .await;
        assert!(matches!(refused, Err(FlowError::Internal { .. })));
    }

    #[tokio::test]
    async fn commit_signal_completes_flow() {
        let node = node().await;
        let hash = TxHash::of(b"settle 10 GBP");
        let handle = node
            .start_flow(Settle { hash, armed: false }, FlowInitiator::rpc("alice"))
            .await
            .unwrap();

        // Signal before or after the flow parks; both paths must resolve it.
        node.notify_commit(hash, CommitOutcome::Committed);
        assert_eq!(handle.result_as::<String>().await.unwrap(), hash.to_hex());
        assert_eq!(
            node.flow_status(handle.run_id()).map(|s| s.state),
            Some(FlowState::Completed)
        );
        assert!(node.flow_handle(handle.run_id()).is_some());
    }

    #[tokio::test]
    async fn shutdown_abandons_waiting_flows() {
        let node = node().await;
        let handle = node
            .start_flow(
                Settle {
                    hash: TxHash::of(b"never"),
                    armed: false,
                },
                FlowInitiator::rpc("alice"),
            )
            .await
            .unwrap();
        for _ in 0..200 {
            if node.scheduler_stats().parked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        node.shutdown();
        assert!(matches!(
            handle.result().await,
            Err(FlowError::Abandoned { .. })
        ));
        assert!(node
            .start_flow(
                Settle {
                    hash: TxHash::of(b"late"),
                    armed: false,
                },
                FlowInitiator::rpc("alice"),
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn recovery_runs_once_and_skips_live_flows() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let node = FlowNodeBuilder::with_identity_name("O=Bank A")
            .with_transport(Arc::new(Discard))
            .with_store(store.clone())
            .register::<Settle>()
            .build()
            .await
            .unwrap();
        let hash = TxHash::of(b"settle 5 GBP");
        let handle = node
            .start_flow(Settle { hash, armed: false }, FlowInitiator::rpc("alice"))
            .await
            .unwrap();
        for _ in 0..200 {
            if node.scheduler_stats().parked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.list_runs().await.unwrap(), vec![handle.run_id()]);

        let report = node.recover().await.unwrap();
        assert!(report.resumed.is_empty());
        assert!(matches!(node.recover().await, Err(FlowError::Internal { .. })));

        node.notify_commit(hash, CommitOutcome::Committed);
        assert_eq!(handle.result_as::<String>().await.unwrap(), hash.to_hex());
        let tracked = node.flow_handle(handle.run_id()).unwrap();
        assert_eq!(tracked.result_as::<String>().await.unwrap(), hash.to_hex());
        assert_eq!(node.scheduler_stats().parked, 0);
    }

    #[tokio::test]
    async fn recovery_after_shutdown_is_refused() {
        let node = node().await;
        node.shutdown();
        assert!(node.recover().await.is_err());
    }
}
