//! Flow instance data model
//!
//! Types persisted in checkpoints and shared between the state machine,
//! the session registry and the recovery path.

use crate::envelope::Envelope;
use crate::errors::FlowError;
use crate::identifiers::{PartyName, RunId, SessionId, SessionRole, TxHash};
use crate::payload::{Payload, PayloadTag};
use crate::protocol::ProtocolDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Logical state of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    /// Constructed, not yet scheduled
    Created,
    /// Executing business logic on a worker
    Running,
    /// Parked on exactly one pending wait
    Suspended,
    /// Resolved with a value
    Completed,
    /// Resolved with a failure
    Failed,
}

impl FlowState {
    /// Whether the state is final
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Completed | FlowState::Failed)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::Created => write!(f, "created"),
            FlowState::Running => write!(f, "running"),
            FlowState::Suspended => write!(f, "suspended"),
            FlowState::Completed => write!(f, "completed"),
            FlowState::Failed => write!(f, "failed"),
        }
    }
}

/// Who or what started a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowInitiator {
    /// An RPC client
    Rpc {
        /// Authenticated RPC user
        username: String,
    },
    /// A scheduled activity firing
    Scheduled {
        /// Scheduled activity name
        activity: String,
    },
    /// An incoming session request from a peer
    Peer {
        /// Requesting party
        party: PartyName,
        /// Session the request arrived on
        session: SessionId,
    },
}

impl FlowInitiator {
    /// RPC initiator
    pub fn rpc(username: impl Into<String>) -> Self {
        Self::Rpc {
            username: username.into(),
        }
    }

    /// Principal name permission checks and audit records refer to
    pub fn principal(&self) -> String {
        match self {
            FlowInitiator::Rpc { username } => username.clone(),
            FlowInitiator::Scheduled { .. } => "scheduler".to_string(),
            FlowInitiator::Peer { party, .. } => format!("peer:{party}"),
        }
    }
}

/// The single event a suspended flow waits for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingWait {
    /// Next message on `session`, declared as `expected`
    Receive {
        /// Awaited session
        session: SessionId,
        /// Expected payload type
        expected: PayloadTag,
    },
    /// One message on every listed session, each of its expected type
    ReceiveAll {
        /// Session to expected type
        expected: BTreeMap<SessionId, PayloadTag>,
    },
    /// Finality signal for a transaction
    LedgerCommit {
        /// Awaited transaction
        hash: TxHash,
    },
    /// Handshake completion on `session`
    Handshake {
        /// Awaited session
        session: SessionId,
    },
}

impl PendingWait {
    /// Sessions the wait depends on
    pub fn sessions(&self) -> Vec<SessionId> {
        match self {
            PendingWait::Receive { session, .. } | PendingWait::Handshake { session } => {
                vec![*session]
            }
            PendingWait::ReceiveAll { expected } => expected.keys().copied().collect(),
            PendingWait::LedgerCommit { .. } => Vec::new(),
        }
    }

    /// Human-readable description for snapshots and logs
    pub fn describe(&self) -> String {
        match self {
            PendingWait::Receive { session, expected } => {
                format!("receive {expected} on {session}")
            }
            PendingWait::ReceiveAll { expected } => {
                let parts: Vec<String> = expected
                    .iter()
                    .map(|(session, tag)| format!("{tag} on {session}"))
                    .collect();
                format!("receive all [{}]", parts.join(", "))
            }
            PendingWait::LedgerCommit { hash } => format!("ledger commit of {hash}"),
            PendingWait::Handshake { session } => format!("handshake on {session}"),
        }
    }
}

/// Lifecycle of a flow session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Init sent, no Confirm yet
    PendingHandshake,
    /// Handshake complete
    Established,
    /// Closed locally or ended by the counterparty
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::PendingHandshake => write!(f, "pending-handshake"),
            SessionState::Established => write!(f, "established"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Checkpointed view of one flow session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id
    pub id: SessionId,
    /// Local role
    pub role: SessionRole,
    /// Counterparty
    pub counterparty: PartyName,
    /// Protocol announced or accepted on the session
    pub protocol: ProtocolDescriptor,
    /// Lifecycle state
    pub state: SessionState,
    /// Version agreed in the handshake
    pub negotiated_version: Option<u32>,
    /// Sequence number the next outbound envelope receives
    pub next_outbound: u64,
    /// Highest inbound sequence consumed by the flow
    pub last_received: u64,
}

/// An envelope queued for hand-off to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Destination party
    pub to: PartyName,
    /// Sequenced envelope
    pub envelope: Envelope,
}

/// Terminal state reported by the ledger finality collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// The transaction is final
    Committed,
    /// The transaction will never be final
    Rejected {
        /// Reason reported by the ledger
        reason: String,
    },
}

/// How a flow resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalOutcome {
    /// Returned a value
    Completed(Payload),
    /// Failed with a cause
    Failed(FlowError),
}

/// Immutable snapshot of a flow at a suspension point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run the checkpoint belongs to
    pub run_id: RunId,
    /// Strictly increasing per run; a save must exceed the stored revision
    pub revision: u64,
    /// Registered flow name used to rehydrate the logic
    pub flow_name: String,
    /// Protocol the flow announces when initiating sessions
    pub protocol: ProtocolDescriptor,
    /// Who started the flow
    pub initiator: FlowInitiator,
    /// Logical state at checkpoint time
    pub state: FlowState,
    /// Serialized business-logic state
    #[serde(with = "serde_bytes")]
    pub logic_state: Vec<u8>,
    /// Sessions owned by the flow
    pub sessions: Vec<SessionRecord>,
    /// Wait to re-arm on resume
    pub pending: Option<PendingWait>,
    /// Envelopes not yet handed to the transport
    pub outbox: Vec<OutboundMessage>,
    /// Send of a `send_and_receive(retry_send = true)` awaiting its reply
    pub retry_send: Option<OutboundMessage>,
    /// Outcome of a terminal flow kept for a retention window
    pub outcome: Option<TerminalOutcome>,
    /// Labels of recent suspension points, newest last
    pub trail: Vec<String>,
    /// When the flow was created
    pub created_at_ms: u64,
    /// When this checkpoint was taken
    pub checkpointed_at_ms: u64,
}

impl Checkpoint {
    /// Whether the checkpoint records a resolved flow
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// What an audit record documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    /// Result of `check_flow_permission`
    PermissionCheck {
        /// Permission name
        permission: String,
        /// Whether it was granted
        granted: bool,
    },
    /// Explicit `record_audit_event`
    Event {
        /// Caller-defined event type
        event_type: String,
    },
    /// Terminal failure of a flow
    FlowFailure {
        /// Error kind
        error_kind: String,
    },
}

/// Append-only audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record id
    pub id: Uuid,
    /// Flow that produced the record
    pub run_id: RunId,
    /// Principal of the flow initiator
    pub principal: String,
    /// Unix milliseconds
    pub timestamp_ms: u64,
    /// Record type
    pub kind: AuditKind,
    /// Free-form comment
    pub comment: String,
    /// Extra caller-supplied data
    pub data: BTreeMap<String, String>,
}

impl AuditRecord {
    /// Create a record stamped with the current time
    pub fn new(
        run_id: RunId,
        principal: impl Into<String>,
        kind: AuditKind,
        comment: impl Into<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            principal: principal.into(),
            timestamp_ms: crate::time::unix_millis(),
            kind,
            comment: comment.into(),
            data,
        }
    }
}

/// One logical frame of a flow stack snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Flow name
    pub flow: String,
    /// Step label reported by the logic
    pub step: String,
    /// Wait the frame is parked on, if any
    pub pending: Option<String>,
}

/// Session summary inside a stack snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id
    pub id: SessionId,
    /// Counterparty
    pub counterparty: PartyName,
    /// Local role
    pub role: SessionRole,
    /// Lifecycle state
    pub state: SessionState,
    /// Highest inbound sequence consumed
    pub last_received: u64,
    /// Next outbound sequence
    pub next_outbound: u64,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id,
            counterparty: record.counterparty.clone(),
            role: record.role,
            state: record.state,
            last_received: record.last_received,
            next_outbound: record.next_outbound,
        }
    }
}

/// Diagnostic view of a flow's logical call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStackSnapshot {
    /// Flow run
    pub run_id: RunId,
    /// Flow name
    pub flow_name: String,
    /// Unix milliseconds
    pub captured_at_ms: u64,
    /// Frames, outermost first
    pub frames: Vec<StackFrame>,
    /// Sessions owned by the flow
    pub sessions: Vec<SessionSummary>,
}
