//! Flow state machine
//!
//! One machine per flow instance. It owns the business logic, the flow's
//! sessions and its outbox, and drives the logic from suspension point to
//! suspension point:
//!
//! 1. run a step with whatever resumed the flow
//! 2. convert the returned [`Wait`] into a [`PendingWait`], sequencing any
//!    send it implies
//! 3. persist a checkpoint, then hand queued envelopes to the transport
//! 4. poll the wait once; if it is already satisfied, loop, otherwise park
//!
//! Parking returns control to the scheduler. Envelopes of a suspending step
//! leave the node only after the checkpoint recording them is durable. A
//! final step hands its envelopes off before the terminal checkpoint; a crash
//! in between re-runs that step, which regenerates them with the same
//! session ids and sequence numbers.
//!
//! A transport refusal is not a flow failure. The refused envelope and
//! everything queued after it stay in the outbox, the flow parks, and the
//! next activation tries again.

use crate::context::FlowContext;
use crate::logic::{DynFlowLogic, Resume, SessionRef, Step, Wait};
use crate::result::ResultSlot;
use crate::services::FlowServices;
use crate::session::FlowSession;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use strand_core::{
    AuditKind, AuditRecord, Checkpoint, CommitOutcome, ErrorCategory, FlowError, FlowInitiator,
    FlowResult, FlowState, OutboundMessage, PartyName, Payload, PendingWait, ProtocolDescriptor,
    RunId, SessionId, SessionMessage, TerminalOutcome, UntrustworthyPayload,
};
use strand_session::{HandshakeStatus, SessionKey, SessionPoll};
use tracing::Instrument;

/// Recent suspension labels kept for stack snapshots
const TRAIL_LIMIT: usize = 8;

/// How an activation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Suspended on a wait that is not yet satisfied
    Parked,
    /// Resolved; the result future has been completed
    Resolved(FlowState),
}

enum StepOutcome {
    Suspended,
    Done(Payload),
}

/// Execution context of one flow instance
pub struct FlowStateMachine {
    run_id: RunId,
    flow_name: String,
    protocol: ProtocolDescriptor,
    initiator: FlowInitiator,
    state: FlowState,
    logic: Box<dyn DynFlowLogic>,
    sessions: BTreeMap<SessionId, FlowSession>,
    pending: Option<PendingWait>,
    outbox: Vec<OutboundMessage>,
    retry_send: Option<OutboundMessage>,
    // output of a finished step whose envelopes are still queued
    finishing: Option<Payload>,
    revision: u64,
    trail: VecDeque<String>,
    created_at_ms: u64,
    services: Arc<FlowServices>,
    result: ResultSlot,
}

impl FlowStateMachine {
    /// Create a machine for a new flow
    pub fn new(
        run_id: RunId,
        logic: Box<dyn DynFlowLogic>,
        initiator: FlowInitiator,
        services: Arc<FlowServices>,
        result: ResultSlot,
    ) -> Self {
        Self {
            run_id,
            flow_name: logic.flow_name().to_string(),
            protocol: logic.announced_protocol(),
            initiator,
            state: FlowState::Created,
            logic,
            sessions: BTreeMap::new(),
            pending: None,
            outbox: Vec::new(),
            retry_send: None,
            finishing: None,
            revision: 0,
            trail: VecDeque::new(),
            created_at_ms: strand_core::time::unix_millis(),
            services,
            result,
        }
    }

    /// Rebuild a machine from its latest checkpoint
    ///
    /// Session routes are restored immediately so that redelivered
    /// envelopes find their way back before the flow is first activated.
    pub fn restore(
        checkpoint: Checkpoint,
        logic: Box<dyn DynFlowLogic>,
        services: Arc<FlowServices>,
        result: ResultSlot,
    ) -> Self {
        let run_id = checkpoint.run_id;
        let mut sessions = BTreeMap::new();
        for record in &checkpoint.sessions {
            services.sessions.restore(run_id, record);
            sessions.insert(record.id, FlowSession::from_record(record));
        }

        Self {
            run_id,
            flow_name: checkpoint.flow_name,
            protocol: checkpoint.protocol,
            initiator: checkpoint.initiator,
            state: checkpoint.state,
            logic,
            sessions,
            pending: checkpoint.pending,
            outbox: checkpoint.outbox,
            retry_send: checkpoint.retry_send,
            finishing: None,
            revision: checkpoint.revision,
            trail: checkpoint.trail.into_iter().collect(),
            created_at_ms: checkpoint.created_at_ms,
            services,
            result,
        }
    }

    /// Run id
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Registered flow name
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Logical state
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Wait the flow is suspended on
    pub fn pending(&self) -> Option<&PendingWait> {
        self.pending.as_ref()
    }

    /// Whether envelopes are queued that the transport has not accepted yet
    pub fn has_unsent(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Bind an accepted inbound session to this (responder) flow and queue
    /// the Confirm carrying the negotiated version
    pub fn accept_session(
        &mut self,
        session_id: SessionId,
        counterparty: PartyName,
        protocol: ProtocolDescriptor,
        negotiated_version: u32,
        init_sequence: u64,
    ) -> SessionRef {
        self.services.sessions.register_responder(
            session_id,
            self.run_id,
            counterparty.clone(),
            protocol.clone(),
            negotiated_version,
            init_sequence,
        );
        let mut session =
            FlowSession::accepted(counterparty, protocol, negotiated_version, init_sequence);
        let confirm = session.envelope(
            session_id,
            &self.services.our_identity,
            SessionMessage::Confirm {
                version: negotiated_version,
            },
        );
        self.outbox.push(confirm);
        self.sessions.insert(session_id, session);
        SessionRef(session_id)
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("flow", run_id = %self.run_id, flow = %self.flow_name)
    }

    /// Persist the initial checkpoint and release any queued handshake
    /// replies
    ///
    /// On failure the flow is resolved as failed and the cause returned.
    pub async fn start(&mut self) -> FlowResult<()> {
        let span = self.span();
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> FlowResult<()> {
        tracing::info!(initiator = %self.initiator.principal(), "Flow created");
        self.publish();
        let started = match self.save_checkpoint().await {
            Ok(()) => self.flush_outbox().await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.fail(e.clone()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Re-send what a crash may have swallowed: the unflushed outbox and an
    /// unacknowledged `retry_send` envelope
    pub async fn replay_outbound(&mut self) -> FlowResult<()> {
        let span = self.span();
        self.replay_inner().instrument(span).await
    }

    async fn replay_inner(&mut self) -> FlowResult<()> {
        if let Some(retry) = &self.retry_send {
            if !self.outbox.contains(retry) {
                self.outbox.push(retry.clone());
            }
        }
        let queued = self.outbox.len();
        if queued == 0 {
            return Ok(());
        }
        self.flush_outbox().await?;
        tracing::info!(
            count = queued - self.outbox.len(),
            unsent = self.outbox.len(),
            "Replayed outbound envelopes"
        );
        Ok(())
    }

    /// Resolve the flow as failed from outside its own execution
    pub async fn abort(&mut self, error: FlowError) -> Activation {
        let span = self.span();
        self.fail(error).instrument(span).await
    }

    /// Run the flow until it parks or resolves
    ///
    /// Activating a terminal instance is an integration defect and returns
    /// [`FlowError::StaleResume`] without touching the flow.
    pub async fn activate(&mut self) -> FlowResult<Activation> {
        if self.state.is_terminal() {
            tracing::error!(run_id = %self.run_id, state = %self.state, "Resume requested for terminal flow");
            return Err(FlowError::StaleResume {
                run_id: self.run_id,
                state: self.state.to_string(),
            });
        }
        let span = self.span();
        Ok(self.drive().instrument(span).await)
    }

    async fn drive(&mut self) -> Activation {
        if let Some(output) = self.finishing.take() {
            return self.complete(output).await;
        }
        if let Err(e) = self.flush_outbox().await {
            return self.fail(e).await;
        }
        loop {
            let resume = match self.next_resume().await {
                Ok(Some(resume)) => resume,
                Ok(None) => {
                    tracing::trace!("Pending wait not yet satisfied");
                    return Activation::Parked;
                }
                Err(e) => return self.fail(e).await,
            };
            match self.run_step(resume).await {
                Ok(StepOutcome::Suspended) => {}
                Ok(StepOutcome::Done(output)) => return self.complete(output).await,
                Err(e) => return self.fail(e).await,
            }
        }
    }

    async fn next_resume(&mut self) -> FlowResult<Option<Resume>> {
        match self.pending.clone() {
            None if self.state == FlowState::Created => Ok(Some(Resume::Start)),
            None => Err(FlowError::internal(format!(
                "flow in state {} has no pending wait",
                self.state
            ))),
            Some(wait) => self.poll_wait(&wait).await,
        }
    }

    async fn run_step(&mut self, resume: Resume) -> FlowResult<StepOutcome> {
        tracing::debug!(resume = resume.kind(), "Resuming flow");
        self.state = FlowState::Running;
        self.pending = None;
        self.retry_send = None;
        self.publish();

        let (step, snapshots) = {
            let mut ctx = FlowContext {
                run_id: self.run_id,
                flow_name: self.flow_name.as_str(),
                protocol: &self.protocol,
                initiator: &self.initiator,
                services: self.services.as_ref(),
                sessions: &mut self.sessions,
                outbox: &mut self.outbox,
                trail: &self.trail,
                step_label: self.logic.current_label(),
                snapshot_requests: Vec::new(),
            };
            let step = self.logic.step_dyn(&mut ctx, resume);
            (step, ctx.snapshot_requests)
        };

        if !snapshots.is_empty() {
            self.persist_snapshots(snapshots).await;
        }

        match step? {
            Step::Done(output) => Ok(StepOutcome::Done(output)),
            Step::Await(wait) => {
                self.suspend(wait).await?;
                Ok(StepOutcome::Suspended)
            }
        }
    }

    async fn suspend(&mut self, wait: Wait) -> FlowResult<()> {
        let pending = self.arm(wait)?;
        let label = self.logic.current_label();
        if self.trail.len() == TRAIL_LIMIT {
            self.trail.pop_front();
        }
        self.trail.push_back(label);

        tracing::debug!(pending = %pending.describe(), "Flow suspending");
        self.pending = Some(pending);
        self.state = FlowState::Suspended;
        self.save_checkpoint().await?;
        self.flush_outbox().await?;
        self.publish();
        Ok(())
    }

    fn key(&self, session: SessionId) -> FlowResult<SessionKey> {
        self.sessions
            .get(&session)
            .map(|s| s.key(session))
            .ok_or(FlowError::UnknownSession { session })
    }

    fn arm(&mut self, wait: Wait) -> FlowResult<PendingWait> {
        match wait {
            Wait::Receive { session, expected } => {
                self.key(session.id())?;
                Ok(PendingWait::Receive {
                    session: session.id(),
                    expected,
                })
            }
            Wait::SendAndReceive {
                session,
                payload,
                expected,
                retry_send,
            } => {
                let sender = &self.services.our_identity;
                let message = self
                    .sessions
                    .get_mut(&session.id())
                    .ok_or(FlowError::UnknownSession {
                        session: session.id(),
                    })?
                    .envelope(session.id(), sender, SessionMessage::Data { payload });
                if retry_send {
                    self.retry_send = Some(message.clone());
                }
                self.outbox.push(message);
                Ok(PendingWait::Receive {
                    session: session.id(),
                    expected,
                })
            }
            Wait::ReceiveAll { expected } => {
                let mut sessions = BTreeMap::new();
                for (session, tag) in expected {
                    self.key(session.id())?;
                    sessions.insert(session.id(), tag);
                }
                Ok(PendingWait::ReceiveAll { expected: sessions })
            }
            Wait::LedgerCommit { hash } => Ok(PendingWait::LedgerCommit { hash }),
            Wait::Handshake { session } => {
                self.key(session.id())?;
                Ok(PendingWait::Handshake {
                    session: session.id(),
                })
            }
        }
    }

    async fn poll_wait(&self, wait: &PendingWait) -> FlowResult<Option<Resume>> {
        let registry = &self.services.sessions;
        match wait {
            PendingWait::Receive { session, expected } => {
                let key = self.key(*session)?;
                match registry.poll(key) {
                    SessionPoll::Ready { payload, .. } => {
                        if payload.tag() != expected {
                            return Err(FlowError::UnexpectedPayloadType {
                                session: *session,
                                expected: expected.clone(),
                                actual: payload.tag().clone(),
                            });
                        }
                        registry.take(key);
                        Ok(Some(Resume::Received {
                            session: SessionRef(*session),
                            data: UntrustworthyPayload::new(payload),
                        }))
                    }
                    SessionPoll::Pending => Ok(None),
                    SessionPoll::Failed(e) => Err(e),
                }
            }
            PendingWait::ReceiveAll { expected } => {
                let mut ready = Vec::with_capacity(expected.len());
                let mut complete = true;
                for (session, tag) in expected {
                    let key = self.key(*session)?;
                    match registry.poll(key) {
                        SessionPoll::Ready { payload, .. } => {
                            if payload.tag() != tag {
                                return Err(FlowError::UnexpectedPayloadType {
                                    session: *session,
                                    expected: tag.clone(),
                                    actual: payload.tag().clone(),
                                });
                            }
                            ready.push((*session, key));
                        }
                        SessionPoll::Pending => complete = false,
                        SessionPoll::Failed(e) => return Err(e),
                    }
                }
                if !complete {
                    return Ok(None);
                }

                let mut received = BTreeMap::new();
                for (session, key) in ready {
                    let (_, payload) = registry.take(key).ok_or_else(|| {
                        FlowError::internal(format!("buffered message on {session} vanished"))
                    })?;
                    received.insert(SessionRef(session), UntrustworthyPayload::new(payload));
                }
                Ok(Some(Resume::ReceivedAll(received)))
            }
            PendingWait::LedgerCommit { hash } => {
                let finality = &self.services.finality;
                finality.register(*hash, self.run_id);
                let mut outcome = finality.outcome(hash);
                if outcome.is_none() {
                    if let Some(ledger) = &self.services.ledger {
                        outcome = ledger.outcome(hash).await;
                    }
                }
                match outcome {
                    Some(CommitOutcome::Committed) => {
                        finality.unregister(hash, self.run_id);
                        Ok(Some(Resume::Committed { hash: *hash }))
                    }
                    Some(CommitOutcome::Rejected { reason }) => {
                        finality.unregister(hash, self.run_id);
                        Err(FlowError::TransactionRejected {
                            hash: *hash,
                            reason,
                        })
                    }
                    None => Ok(None),
                }
            }
            PendingWait::Handshake { session } => {
                let key = self.key(*session)?;
                match registry.handshake(key) {
                    HandshakeStatus::Established(info) => Ok(Some(Resume::FlowInfo {
                        session: SessionRef(*session),
                        info,
                    })),
                    HandshakeStatus::Pending => Ok(None),
                    HandshakeStatus::Failed(e) => Err(e),
                }
            }
        }
    }

    fn build_checkpoint(&mut self, outcome: Option<TerminalOutcome>) -> FlowResult<Checkpoint> {
        let registry = &self.services.sessions;
        for (id, session) in self.sessions.iter_mut() {
            if let Some(view) = registry.view(session.key(*id)) {
                session.refresh(&view);
            }
        }

        Ok(Checkpoint {
            run_id: self.run_id,
            revision: self.revision,
            flow_name: self.flow_name.clone(),
            protocol: self.protocol.clone(),
            initiator: self.initiator.clone(),
            state: self.state,
            logic_state: self.logic.encode_state()?,
            sessions: self
                .sessions
                .iter()
                .map(|(id, session)| session.record(*id))
                .collect(),
            pending: self.pending.clone(),
            outbox: self.outbox.clone(),
            retry_send: self.retry_send.clone(),
            outcome,
            trail: self.trail.iter().cloned().collect(),
            created_at_ms: self.created_at_ms,
            checkpointed_at_ms: strand_core::time::unix_millis(),
        })
    }

    async fn save_checkpoint(&mut self) -> FlowResult<()> {
        self.revision += 1;
        let checkpoint = self.build_checkpoint(None)?;
        self.services.store.save(&checkpoint).await?;
        tracing::trace!(revision = self.revision, state = %self.state, "Checkpoint persisted");
        Ok(())
    }

    /// Hand the outbox to the transport and record what was flushed
    ///
    /// A crash between the hand-off and the follow-up checkpoint replays
    /// the outbox on recovery; receivers drop the copies by sequence number.
    async fn flush_outbox(&mut self) -> FlowResult<()> {
        if self.hand_off().await? > 0 {
            self.save_checkpoint().await?;
        }
        Ok(())
    }

    /// Hand queued envelopes to the transport, oldest first
    ///
    /// Stops at the first transport refusal, keeping that envelope and the
    /// ones behind it queued. Returns how many were handed off.
    async fn hand_off(&mut self) -> FlowResult<usize> {
        let mut delivered = 0;
        while let Some(message) = self.outbox.get(delivered) {
            match self.dispatch_one(message).await {
                Ok(()) => delivered += 1,
                Err(FlowError::Transport { message: reason }) => {
                    tracing::warn!(
                        error = %reason,
                        unsent = self.outbox.len() - delivered,
                        "Transport refused envelope; keeping it queued"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.outbox.drain(..delivered);
        Ok(delivered)
    }

    async fn dispatch_one(&self, message: &OutboundMessage) -> FlowResult<()> {
        let destination = self.services.identity.resolve(&message.to)?;
        self.services
            .transport
            .send_envelope(&destination, message.envelope.clone())
            .await?;
        tracing::trace!(
            to = %message.to,
            session = %message.envelope.session_id,
            sequence = message.envelope.sequence,
            kind = message.envelope.message.kind(),
            "Envelope handed to transport"
        );
        Ok(())
    }

    async fn persist_snapshots(&self, snapshots: Vec<strand_core::FlowStackSnapshot>) {
        let Some(sink) = &self.services.snapshots else {
            tracing::debug!(count = snapshots.len(), "No snapshot sink configured; dropping snapshots");
            return;
        };
        for snapshot in &snapshots {
            if let Err(e) = sink.persist(snapshot).await {
                tracing::warn!(error = %e, "Failed to persist flow stack snapshot");
            }
        }
    }

    /// Send End to every session whose counterparty is still listening
    async fn end_sessions(&mut self, error: Option<String>) {
        let registry = &self.services.sessions;
        let sender = &self.services.our_identity;
        let mut ends = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            let listening = registry
                .view(session.key(*id))
                .map(|view| !view.peer_closed)
                .unwrap_or(false);
            if listening {
                ends.push(session.envelope(
                    *id,
                    sender,
                    SessionMessage::End {
                        error: error.clone(),
                    },
                ));
            }
        }
        for end in &ends {
            if let Err(e) = self.dispatch_one(end).await {
                tracing::warn!(error = %e, session = %end.envelope.session_id, "Failed to end session");
            }
        }
    }

    async fn complete(&mut self, output: Payload) -> Activation {
        match self.hand_off().await {
            Ok(_) if self.outbox.is_empty() => {}
            Ok(_) => {
                self.finishing = Some(output);
                return Activation::Parked;
            }
            Err(e) => return self.fail(e).await,
        }
        self.end_sessions(None).await;
        self.state = FlowState::Completed;
        self.finish(TerminalOutcome::Completed(output.clone())).await;
        self.result.resolve(Ok(output));
        tracing::info!("Flow completed");
        Activation::Resolved(FlowState::Completed)
    }

    async fn fail(&mut self, error: FlowError) -> Activation {
        self.outbox.clear();
        self.finishing = None;
        self.retry_send = None;
        self.pending = None;
        match error.category() {
            ErrorCategory::Infrastructure | ErrorCategory::Recovery | ErrorCategory::Misuse => {
                tracing::error!(error = %error, kind = error.kind(), "Flow failed");
            }
            _ => tracing::warn!(error = %error, kind = error.kind(), "Flow failed"),
        }

        self.end_sessions(Some(error.to_string())).await;
        let record = AuditRecord::new(
            self.run_id,
            self.initiator.principal(),
            AuditKind::FlowFailure {
                error_kind: error.kind().to_string(),
            },
            error.to_string(),
            BTreeMap::from([("flow".to_string(), self.flow_name.clone())]),
        );
        if let Err(e) = self.services.audit.record(record) {
            tracing::warn!(error = %e, "Failed to audit flow failure");
        }

        self.state = FlowState::Failed;
        self.finish(TerminalOutcome::Failed(error.clone())).await;
        self.result.resolve(Err(error));
        Activation::Resolved(FlowState::Failed)
    }

    /// Drop routes and apply the retention policy to the checkpoint
    async fn finish(&mut self, outcome: TerminalOutcome) {
        self.services.finality.forget_run(self.run_id);
        let retention = self.services.retention;
        if retention.is_zero() {
            if let Err(e) = self.services.store.delete(self.run_id).await {
                tracing::warn!(error = %e, "Failed to delete checkpoint of resolved flow");
            }
        } else {
            self.revision += 1;
            let saved = match self.build_checkpoint(Some(outcome)) {
                Ok(checkpoint) => self.services.store.save(&checkpoint).await.map_err(FlowError::from),
                Err(e) => Err(e),
            };
            match saved {
                Ok(()) => tracing::debug!(retention_secs = retention.as_secs(), "Terminal checkpoint retained"),
                Err(e) => tracing::warn!(error = %e, "Failed to write terminal checkpoint"),
            }
        }
        self.services.sessions.close_run(self.run_id);
        self.publish();
    }

    fn publish(&self) {
        self.services.table.update(
            self.run_id,
            &self.flow_name,
            self.state,
            self.pending.as_ref().map(PendingWait::describe),
        );
    }
}

impl std::fmt::Debug for FlowStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStateMachine")
            .field("run_id", &self.run_id)
            .field("flow_name", &self.flow_name)
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}
