//! Node-wide flow session registry
//!
//! Routes inbound envelopes to the owning flow by `(session id, local
//! role)`, processes handshake replies, and buffers data until the flow
//! reaches the matching receive point. Flows consume from the buffer
//! explicitly, which is what advances the "last consumed" sequence stored
//! in their checkpoints.

use crate::dedup::{Admission, InboundDeduplicator};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use strand_core::{
    Envelope, FlowError, FlowInfo, PartyName, Payload, ProtocolDescriptor, RejectReason, RunId,
    SessionId, SessionMessage, SessionRecord, SessionRole, SessionState,
};

/// Routing key of a session on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Session id shared with the counterparty
    pub id: SessionId,
    /// Role the local flow plays
    pub role: SessionRole,
}

impl SessionKey {
    /// Create a key
    pub fn new(id: SessionId, role: SessionRole) -> Self {
        Self { id, role }
    }
}

impl From<&SessionRecord> for SessionKey {
    fn from(record: &SessionRecord) -> Self {
        Self::new(record.id, record.role)
    }
}

#[derive(Debug, Clone)]
enum Inbound {
    Data { sequence: u64, payload: Payload },
    End { error: Option<String> },
}

#[derive(Debug)]
struct SessionEntry {
    run_id: RunId,
    counterparty: PartyName,
    protocol: ProtocolDescriptor,
    state: SessionState,
    negotiated_version: Option<u32>,
    dedup: InboundDeduplicator,
    consumed: u64,
    inbox: VecDeque<Inbound>,
    failure: Option<FlowError>,
    peer_closed: bool,
}

impl SessionEntry {
    fn new(
        run_id: RunId,
        counterparty: PartyName,
        protocol: ProtocolDescriptor,
        state: SessionState,
        negotiated_version: Option<u32>,
        consumed: u64,
    ) -> Self {
        Self {
            run_id,
            counterparty,
            protocol,
            state,
            negotiated_version,
            dedup: InboundDeduplicator::starting_after(consumed),
            consumed,
            inbox: VecDeque::new(),
            failure: None,
            peer_closed: false,
        }
    }
}

/// What happened to one inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Data or End buffered for the owning flow
    Accepted {
        /// Owning flow
        run_id: RunId,
    },
    /// A handshake reply (Confirm or Reject) was processed
    HandshakeCompleted {
        /// Owning flow
        run_id: RunId,
    },
    /// Init for a session this node does not know yet
    SessionRequest {
        /// Session chosen by the initiator
        session_id: SessionId,
        /// Requesting party
        sender: PartyName,
        /// Announced protocol name
        protocol: String,
        /// Announced protocol version
        version: u32,
        /// Sequence number of the Init envelope
        sequence: u64,
    },
    /// Retransmission of an already accepted envelope
    Duplicate,
    /// No session matches and the envelope cannot open one
    Unroutable,
    /// The sender is not the session's counterparty
    UnexpectedSender {
        /// Session counterparty
        expected: PartyName,
        /// Claimed sender
        actual: PartyName,
    },
    /// Well-formed but meaningless in the session's current state
    Ignored,
}

impl DeliveryOutcome {
    /// Flow that should be woken, if any
    pub fn wake_target(&self) -> Option<RunId> {
        match self {
            DeliveryOutcome::Accepted { run_id }
            | DeliveryOutcome::HandshakeCompleted { run_id } => Some(*run_id),
            _ => None,
        }
    }
}

/// Non-consuming view of a session's next inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPoll {
    /// A data message is buffered
    Ready {
        /// Its sequence number
        sequence: u64,
        /// Its payload
        payload: Payload,
    },
    /// Nothing buffered yet
    Pending,
    /// The session can never deliver again
    Failed(FlowError),
}

/// Handshake progress of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Waiting for Confirm
    Pending,
    /// Negotiation finished
    Established(FlowInfo),
    /// Rejected or incompatible
    Failed(FlowError),
}

/// Snapshot of one session's routing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    /// Owning flow
    pub run_id: RunId,
    /// Counterparty
    pub counterparty: PartyName,
    /// Lifecycle state
    pub state: SessionState,
    /// Version agreed in the handshake
    pub negotiated_version: Option<u32>,
    /// Highest sequence consumed by the flow
    pub last_consumed: u64,
    /// Whether the counterparty already ended or refused the session
    pub peer_closed: bool,
    /// Buffered, unconsumed messages
    pub buffered: usize,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions currently routed
    pub active_sessions: usize,
    /// Envelopes accepted
    pub accepted: u64,
    /// Retransmissions dropped
    pub duplicates: u64,
    /// Envelopes with no route
    pub unroutable: u64,
    /// Envelopes dropped for a mismatched sender
    pub unexpected_senders: u64,
    /// Inbound session requests surfaced
    pub session_requests: u64,
}

/// Closed routes remembered so that late retransmissions (an Init replayed
/// after the responder already finished) are dropped instead of opening a
/// second session
const CLOSED_ROUTE_MEMORY: usize = 4096;

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<SessionKey, SessionEntry>,
    closed: HashSet<SessionKey>,
    closed_order: VecDeque<SessionKey>,
    // session requests handed out but not yet accepted or declined
    pending_requests: HashSet<SessionKey>,
    stats: RegistryStats,
}

impl RegistryState {
    fn remember_closed(&mut self, key: SessionKey) {
        if !self.closed.insert(key) {
            return;
        }
        self.closed_order.push_back(key);
        if self.closed_order.len() > CLOSED_ROUTE_MEMORY {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }
}

/// Session table shared by every flow on a node
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the initiator-side session `id` for `run_id`
    pub fn open(
        &self,
        id: SessionId,
        run_id: RunId,
        counterparty: PartyName,
        protocol: ProtocolDescriptor,
    ) {
        let entry = SessionEntry::new(
            run_id,
            counterparty,
            protocol,
            SessionState::PendingHandshake,
            None,
            0,
        );
        self.state
            .lock()
            .sessions
            .insert(SessionKey::new(id, SessionRole::Initiator), entry);
        tracing::debug!(%run_id, session = %id, "Session opened");
    }

    /// Route an accepted session request to the responder flow `run_id`
    pub fn register_responder(
        &self,
        session_id: SessionId,
        run_id: RunId,
        counterparty: PartyName,
        protocol: ProtocolDescriptor,
        negotiated_version: u32,
        init_sequence: u64,
    ) {
        let entry = SessionEntry::new(
            run_id,
            counterparty,
            protocol,
            SessionState::Established,
            Some(negotiated_version),
            init_sequence,
        );
        let key = SessionKey::new(session_id, SessionRole::Responder);
        let mut state = self.state.lock();
        state.pending_requests.remove(&key);
        state.sessions.insert(key, entry);
        tracing::debug!(%run_id, session = %session_id, "Responder session registered");
    }

    /// Drop a session request that will not be accepted
    ///
    /// Later envelopes on the session, including a re-sent `Init`, are
    /// treated as duplicates of a closed route.
    pub fn decline_request(&self, session_id: SessionId) {
        let key = SessionKey::new(session_id, SessionRole::Responder);
        let mut state = self.state.lock();
        if state.pending_requests.remove(&key) {
            state.remember_closed(key);
            tracing::debug!(session = %session_id, "Session request declined");
        }
    }

    /// Rebuild the route of a checkpointed session
    ///
    /// The deduplicator restarts at the checkpointed "last consumed"
    /// sequence so that messages buffered but not consumed before a crash
    /// are accepted again when the transport redelivers them.
    pub fn restore(&self, run_id: RunId, record: &SessionRecord) {
        if record.state == SessionState::Closed {
            return;
        }
        let entry = SessionEntry::new(
            run_id,
            record.counterparty.clone(),
            record.protocol.clone(),
            record.state,
            record.negotiated_version,
            record.last_received,
        );
        self.state.lock().sessions.insert(SessionKey::from(record), entry);
    }

    /// Route one envelope from the transport
    pub fn deliver(&self, envelope: &Envelope) -> DeliveryOutcome {
        let mut guard = self.state.lock();
        let RegistryState {
            sessions,
            closed,
            pending_requests,
            stats,
            ..
        } = &mut *guard;
        let key = SessionKey::new(envelope.session_id, envelope.recipient_role);

        let Some(entry) = sessions.get_mut(&key) else {
            if closed.contains(&key) || pending_requests.contains(&key) {
                stats.duplicates += 1;
                tracing::debug!(
                    session = %envelope.session_id,
                    kind = envelope.message.kind(),
                    "Dropping envelope for closed or pending session"
                );
                return DeliveryOutcome::Duplicate;
            }
            return match &envelope.message {
                SessionMessage::Init { protocol, version }
                    if envelope.recipient_role == SessionRole::Responder =>
                {
                    stats.session_requests += 1;
                    pending_requests.insert(key);
                    DeliveryOutcome::SessionRequest {
                        session_id: envelope.session_id,
                        sender: envelope.sender.clone(),
                        protocol: protocol.clone(),
                        version: *version,
                        sequence: envelope.sequence,
                    }
                }
                _ => {
                    stats.unroutable += 1;
                    tracing::debug!(
                        session = %envelope.session_id,
                        kind = envelope.message.kind(),
                        "Dropping envelope for unknown session"
                    );
                    DeliveryOutcome::Unroutable
                }
            };
        };

        if envelope.sender != entry.counterparty {
            stats.unexpected_senders += 1;
            tracing::warn!(
                session = %envelope.session_id,
                expected = %entry.counterparty,
                actual = %envelope.sender,
                "Dropping envelope from unexpected sender"
            );
            return DeliveryOutcome::UnexpectedSender {
                expected: entry.counterparty.clone(),
                actual: envelope.sender.clone(),
            };
        }

        if entry.dedup.admit(envelope.sequence) == Admission::Duplicate {
            stats.duplicates += 1;
            tracing::debug!(
                session = %envelope.session_id,
                sequence = envelope.sequence,
                "Dropping duplicate envelope"
            );
            return DeliveryOutcome::Duplicate;
        }
        stats.accepted += 1;
        let run_id = entry.run_id;

        match &envelope.message {
            SessionMessage::Data { payload } => {
                entry.inbox.push_back(Inbound::Data {
                    sequence: envelope.sequence,
                    payload: payload.clone(),
                });
                DeliveryOutcome::Accepted { run_id }
            }
            SessionMessage::End { error } => {
                entry.peer_closed = true;
                entry.inbox.push_back(Inbound::End {
                    error: error.clone(),
                });
                DeliveryOutcome::Accepted { run_id }
            }
            SessionMessage::Confirm { version }
                if entry.state == SessionState::PendingHandshake =>
            {
                entry.consumed = envelope.sequence;
                match entry.protocol.accept_negotiated(*version) {
                    Ok(version) => {
                        entry.state = SessionState::Established;
                        entry.negotiated_version = Some(version);
                    }
                    Err(err) => {
                        entry.state = SessionState::Closed;
                        entry.failure = Some(err);
                    }
                }
                DeliveryOutcome::HandshakeCompleted { run_id }
            }
            SessionMessage::Reject { reason } if entry.state == SessionState::PendingHandshake => {
                entry.consumed = envelope.sequence;
                entry.state = SessionState::Closed;
                entry.peer_closed = true;
                entry.failure = Some(match reason {
                    RejectReason::IncompatibleVersion { local, .. } => {
                        FlowError::IncompatibleVersion {
                            protocol: entry.protocol.name.clone(),
                            local: entry.protocol.version,
                            remote: *local,
                        }
                    }
                    RejectReason::UnknownProtocol { .. } => FlowError::SessionRejected {
                        session: envelope.session_id,
                        reason: reason.to_string(),
                    },
                });
                DeliveryOutcome::HandshakeCompleted { run_id }
            }
            other => {
                tracing::debug!(
                    session = %envelope.session_id,
                    kind = other.kind(),
                    state = %entry.state,
                    "Ignoring envelope not valid in session state"
                );
                DeliveryOutcome::Ignored
            }
        }
    }

    /// Look at the next buffered message without consuming it
    pub fn poll(&self, key: SessionKey) -> SessionPoll {
        let state = self.state.lock();
        let Some(entry) = state.sessions.get(&key) else {
            return SessionPoll::Failed(FlowError::UnknownSession { session: key.id });
        };
        match entry.inbox.front() {
            Some(Inbound::Data { sequence, payload }) => SessionPoll::Ready {
                sequence: *sequence,
                payload: payload.clone(),
            },
            Some(Inbound::End { error }) => SessionPoll::Failed(FlowError::SessionEnded {
                session: key.id,
                reason: error.clone(),
            }),
            None => match &entry.failure {
                Some(failure) => SessionPoll::Failed(failure.clone()),
                None => SessionPoll::Pending,
            },
        }
    }

    /// Consume the next buffered data message
    pub fn take(&self, key: SessionKey) -> Option<(u64, Payload)> {
        let mut state = self.state.lock();
        let entry = state.sessions.get_mut(&key)?;
        match entry.inbox.front() {
            Some(Inbound::Data { .. }) => {}
            _ => return None,
        }
        match entry.inbox.pop_front() {
            Some(Inbound::Data { sequence, payload }) => {
                entry.consumed = sequence;
                Some((sequence, payload))
            }
            _ => None,
        }
    }

    /// Handshake progress of a session
    pub fn handshake(&self, key: SessionKey) -> HandshakeStatus {
        let state = self.state.lock();
        let Some(entry) = state.sessions.get(&key) else {
            return HandshakeStatus::Failed(FlowError::UnknownSession { session: key.id });
        };
        match (entry.state, entry.negotiated_version, &entry.failure) {
            (SessionState::Established, Some(version), _) => {
                HandshakeStatus::Established(FlowInfo {
                    protocol: entry.protocol.name.clone(),
                    version,
                })
            }
            (_, _, Some(failure)) => HandshakeStatus::Failed(failure.clone()),
            _ => HandshakeStatus::Pending,
        }
    }

    /// Routing state of a session
    pub fn view(&self, key: SessionKey) -> Option<SessionView> {
        let state = self.state.lock();
        state.sessions.get(&key).map(|entry| SessionView {
            run_id: entry.run_id,
            counterparty: entry.counterparty.clone(),
            state: entry.state,
            negotiated_version: entry.negotiated_version,
            last_consumed: entry.consumed,
            peer_closed: entry.peer_closed,
            buffered: entry.inbox.len(),
        })
    }

    /// Drop one route
    pub fn close(&self, key: SessionKey) {
        let mut state = self.state.lock();
        if state.sessions.remove(&key).is_some() {
            state.remember_closed(key);
        }
    }

    /// Drop every route owned by `run_id`, returning how many were removed
    pub fn close_run(&self, run_id: RunId) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<SessionKey> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.run_id == run_id)
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            state.sessions.remove(key);
            state.remember_closed(*key);
        }
        keys.len()
    }

    /// Delivery counters
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            active_sessions: state.sessions.len(),
            ..state.stats
        }
    }
}
