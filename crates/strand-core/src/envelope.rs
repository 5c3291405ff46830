//! Session envelopes
//!
//! The unit handed to and received from the transport collaborator. The
//! envelope layout is internal to the flow engine; how the transport puts it
//! on the wire is the transport's business.

use crate::identifiers::{PartyName, SessionId, SessionRole};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a responder refused a session request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// No responder flow is registered for the announced protocol
    UnknownProtocol {
        /// Announced protocol name
        protocol: String,
    },
    /// The announced version is older than the responder understands
    IncompatibleVersion {
        /// Responder's current version
        local: u32,
        /// Version announced by the initiator
        remote: u32,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownProtocol { protocol } => {
                write!(f, "no responder registered for {protocol}")
            }
            RejectReason::IncompatibleVersion { local, remote } => {
                write!(f, "version {remote} not supported (responder at {local})")
            }
        }
    }
}

/// Message carried on a flow session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Handshake opening a session for `protocol`
    Init {
        /// Protocol name
        protocol: String,
        /// Version the initiator speaks
        version: u32,
    },
    /// Handshake acceptance carrying the negotiated version
    Confirm {
        /// Negotiated version
        version: u32,
    },
    /// Handshake refusal
    Reject {
        /// Why the session was refused
        reason: RejectReason,
    },
    /// Business payload
    Data {
        /// Tagged payload
        payload: Payload,
    },
    /// The sending flow finished; `error` is set when it failed
    End {
        /// Failure description of the sending flow
        error: Option<String>,
    },
}

impl SessionMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SessionMessage::Init { .. } => "init",
            SessionMessage::Confirm { .. } => "confirm",
            SessionMessage::Reject { .. } => "reject",
            SessionMessage::Data { .. } => "data",
            SessionMessage::End { .. } => "end",
        }
    }
}

/// One sequenced message on one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Party that sent the envelope
    pub sender: PartyName,
    /// Session the envelope belongs to
    pub session_id: SessionId,
    /// Role the receiving side plays in the session
    pub recipient_role: SessionRole,
    /// Sender-assigned sequence number, strictly increasing per session
    pub sequence: u64,
    /// Message body
    pub message: SessionMessage,
}

impl Envelope {
    /// Declared payload type of a data envelope
    pub fn declared_type(&self) -> Option<&crate::payload::PayloadTag> {
        match &self.message {
            SessionMessage::Data { payload } => Some(payload.tag()),
            _ => None,
        }
    }
}
