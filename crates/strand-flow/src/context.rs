//! Per-step execution context
//!
//! Immediate operations (opening sessions, sends, permission checks, audit
//! events, stack snapshots) happen through the context during a step. Sends
//! are only queued here; the state machine checkpoints them before anything
//! reaches the transport.

use crate::logic::SessionRef;
use crate::services::FlowServices;
use crate::session::FlowSession;
use std::collections::{BTreeMap, VecDeque};
use strand_core::{
    AuditKind, AuditRecord, FlowError, FlowInitiator, FlowResult, FlowStackSnapshot,
    MessagePayload, OutboundMessage, PartyName, Payload, ProtocolDescriptor, RunId, SessionId,
    SessionMessage, SessionRole, StackFrame,
};

/// Handle a running step uses to reach its session and collaborators
pub struct FlowContext<'a> {
    pub(crate) run_id: RunId,
    pub(crate) flow_name: &'a str,
    pub(crate) protocol: &'a ProtocolDescriptor,
    pub(crate) initiator: &'a FlowInitiator,
    pub(crate) services: &'a FlowServices,
    pub(crate) sessions: &'a mut BTreeMap<SessionId, FlowSession>,
    pub(crate) outbox: &'a mut Vec<OutboundMessage>,
    pub(crate) trail: &'a VecDeque<String>,
    pub(crate) step_label: String,
    pub(crate) snapshot_requests: Vec<FlowStackSnapshot>,
}

impl<'a> FlowContext<'a> {
    /// Run id of the executing flow
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Who started the flow
    pub fn initiator(&self) -> &FlowInitiator {
        self.initiator
    }

    /// Identity of the local node
    pub fn our_identity(&self) -> &PartyName {
        &self.services.our_identity
    }

    /// Counterparty of an owned session
    pub fn counterparty(&self, session: SessionRef) -> FlowResult<PartyName> {
        self.sessions
            .get(&session.id())
            .map(|s| s.counterparty.clone())
            .ok_or(FlowError::UnknownSession {
                session: session.id(),
            })
    }

    /// Open a session with `counterparty` and queue the handshake
    ///
    /// Does not wait for the reply; the first receive (or
    /// [`Wait::flow_info`](crate::Wait::flow_info)) on the session does.
    pub fn initiate_flow(&mut self, counterparty: impl Into<PartyName>) -> FlowResult<SessionRef> {
        let counterparty = counterparty.into();
        self.services
            .identity
            .resolve(&counterparty)
            .map_err(|e| FlowError::SessionInitiation {
                party: counterparty.clone(),
                reason: e.to_string(),
            })?;

        let ordinal = self
            .sessions
            .values()
            .filter(|s| s.role == SessionRole::Initiator)
            .count() as u64;
        let id = SessionId::derived(self.run_id, ordinal);
        self.services.sessions.open(
            id,
            self.run_id,
            counterparty.clone(),
            self.protocol.clone(),
        );
        let mut session = FlowSession::initiated(counterparty.clone(), self.protocol.clone());
        let init = session.envelope(
            id,
            &self.services.our_identity,
            SessionMessage::Init {
                protocol: self.protocol.name.clone(),
                version: self.protocol.version,
            },
        );
        self.outbox.push(init);
        self.sessions.insert(id, session);
        tracing::info!(session = %id, %counterparty, protocol = %self.protocol, "Initiating session");
        Ok(SessionRef(id))
    }

    /// Queue `payload` on `session` without waiting for acknowledgement
    pub fn send<T: MessagePayload>(&mut self, session: SessionRef, payload: &T) -> FlowResult<()> {
        let payload = Payload::encode(payload)?;
        self.send_payload(session, payload)
    }

    pub(crate) fn send_payload(&mut self, session: SessionRef, payload: Payload) -> FlowResult<()> {
        let message = self.sequence(session, SessionMessage::Data { payload })?;
        tracing::debug!(
            session = %session,
            sequence = message.envelope.sequence,
            "Queued send"
        );
        self.outbox.push(message);
        Ok(())
    }

    pub(crate) fn sequence(
        &mut self,
        session: SessionRef,
        message: SessionMessage,
    ) -> FlowResult<OutboundMessage> {
        let sender = &self.services.our_identity;
        let flow_session = self
            .sessions
            .get_mut(&session.id())
            .ok_or(FlowError::UnknownSession {
                session: session.id(),
            })?;
        Ok(flow_session.envelope(session.id(), sender, message))
    }

    /// Check that the flow initiator holds `permission`
    ///
    /// Always appends exactly one audit record. A denial, or an audit sink
    /// failure on this path, is fatal to the flow.
    pub fn check_flow_permission(
        &mut self,
        permission: &str,
        audit_data: BTreeMap<String, String>,
    ) -> FlowResult<()> {
        let granted = self
            .services
            .permissions
            .has_permission(self.initiator, permission);
        let principal = self.initiator.principal();
        let record = AuditRecord::new(
            self.run_id,
            principal.clone(),
            AuditKind::PermissionCheck {
                permission: permission.to_string(),
                granted,
            },
            format!("Flow permission check for {permission}"),
            audit_data,
        );
        self.services.audit.record(record)?;

        if granted {
            tracing::debug!(%principal, permission, "Flow permission granted");
            Ok(())
        } else {
            tracing::warn!(%principal, permission, "Flow permission denied");
            Err(FlowError::PermissionDenied {
                principal,
                permission: permission.to_string(),
            })
        }
    }

    /// Append an audit record; failures are logged, never raised
    pub fn record_audit_event(
        &mut self,
        event_type: &str,
        comment: &str,
        audit_data: BTreeMap<String, String>,
    ) {
        let record = AuditRecord::new(
            self.run_id,
            self.initiator.principal(),
            AuditKind::Event {
                event_type: event_type.to_string(),
            },
            comment,
            audit_data,
        );
        if let Err(e) = self.services.audit.record(record) {
            tracing::warn!(error = %e, event_type, "Failed to record audit event");
        }
    }

    /// Capture the flow's logical call stack
    pub fn flow_stack_snapshot(&self) -> FlowStackSnapshot {
        let mut frames: Vec<StackFrame> = self
            .trail
            .iter()
            .map(|step| StackFrame {
                flow: self.flow_name.to_string(),
                step: step.clone(),
                pending: None,
            })
            .collect();
        frames.push(StackFrame {
            flow: self.flow_name.to_string(),
            step: self.step_label.clone(),
            pending: None,
        });

        FlowStackSnapshot {
            run_id: self.run_id,
            flow_name: self.flow_name.to_string(),
            captured_at_ms: strand_core::time::unix_millis(),
            frames,
            sessions: self
                .sessions
                .iter()
                .map(|(id, session)| session.summary(*id))
                .collect(),
        }
    }

    /// Capture a snapshot and hand it to the node's snapshot sink once the
    /// step ends
    pub fn persist_flow_stack_snapshot(&mut self) {
        let snapshot = self.flow_stack_snapshot();
        self.snapshot_requests.push(snapshot);
    }
}
