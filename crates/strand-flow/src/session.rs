//! Flow-owned session state

use strand_core::{
    Envelope, OutboundMessage, PartyName, ProtocolDescriptor, SessionId, SessionMessage,
    SessionRecord, SessionRole, SessionState, SessionSummary,
};
use strand_session::{OutboundSequencer, SessionKey, SessionView};

/// One session as the owning flow sees it
///
/// The outbound counter lives here; handshake state and the consumed
/// high-water mark live in the session registry and are mirrored into this
/// struct whenever the flow checkpoints.
#[derive(Debug, Clone)]
pub(crate) struct FlowSession {
    pub role: SessionRole,
    pub counterparty: PartyName,
    pub protocol: ProtocolDescriptor,
    pub sequencer: OutboundSequencer,
    pub state: SessionState,
    pub negotiated_version: Option<u32>,
    pub last_received: u64,
}

impl FlowSession {
    pub fn initiated(counterparty: PartyName, protocol: ProtocolDescriptor) -> Self {
        Self {
            role: SessionRole::Initiator,
            counterparty,
            protocol,
            sequencer: OutboundSequencer::new(),
            state: SessionState::PendingHandshake,
            negotiated_version: None,
            last_received: 0,
        }
    }

    pub fn accepted(
        counterparty: PartyName,
        protocol: ProtocolDescriptor,
        negotiated_version: u32,
        init_sequence: u64,
    ) -> Self {
        Self {
            role: SessionRole::Responder,
            counterparty,
            protocol,
            sequencer: OutboundSequencer::new(),
            state: SessionState::Established,
            negotiated_version: Some(negotiated_version),
            last_received: init_sequence,
        }
    }

    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            role: record.role,
            counterparty: record.counterparty.clone(),
            protocol: record.protocol.clone(),
            sequencer: OutboundSequencer::resume_at(record.next_outbound),
            state: record.state,
            negotiated_version: record.negotiated_version,
            last_received: record.last_received,
        }
    }

    pub fn key(&self, id: SessionId) -> SessionKey {
        SessionKey::new(id, self.role)
    }

    pub fn refresh(&mut self, view: &SessionView) {
        self.state = view.state;
        self.negotiated_version = view.negotiated_version;
        self.last_received = view.last_consumed;
    }

    /// Sequence and address a message to the counterparty
    pub fn envelope(
        &mut self,
        id: SessionId,
        sender: &PartyName,
        message: SessionMessage,
    ) -> OutboundMessage {
        OutboundMessage {
            to: self.counterparty.clone(),
            envelope: Envelope {
                sender: sender.clone(),
                session_id: id,
                recipient_role: self.role.peer(),
                sequence: self.sequencer.next_sequence(),
                message,
            },
        }
    }

    pub fn record(&self, id: SessionId) -> SessionRecord {
        SessionRecord {
            id,
            role: self.role,
            counterparty: self.counterparty.clone(),
            protocol: self.protocol.clone(),
            state: self.state,
            negotiated_version: self.negotiated_version,
            next_outbound: self.sequencer.peek(),
            last_received: self.last_received,
        }
    }

    pub fn summary(&self, id: SessionId) -> SessionSummary {
        SessionSummary::from(&self.record(id))
    }
}
