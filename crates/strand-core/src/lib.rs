//! # Strand Core
//!
//! Foundation types for the Strand durable flow engine: identifiers, the
//! tagged payload model, session envelopes, checkpoint data, the unified
//! error taxonomy and the effect interfaces every external collaborator is
//! reached through.
//!
//! Nothing in this crate performs I/O. Storage, transport, identity, audit
//! and ledger finality are supplied by implementations of the traits in
//! [`effects`].

pub mod effects;
pub mod envelope;
pub mod errors;
pub mod flow;
pub mod identifiers;
pub mod payload;
pub mod protocol;
pub mod time;

pub use effects::{
    AuditError, AuditSink, CheckpointStore, EnvelopeHandler, FinalityEffects, FlowWaker,
    IdentityEffects, IdentityError, NetworkIdentity, PermissionEvaluator, SnapshotSink,
    StoreError, TransportEffects, TransportError,
};
pub use envelope::{Envelope, RejectReason, SessionMessage};
pub use errors::{ErrorCategory, FlowError, FlowResult};
pub use flow::{
    AuditKind, AuditRecord, Checkpoint, CommitOutcome, FlowInitiator, FlowStackSnapshot,
    FlowState, OutboundMessage, PendingWait, SessionRecord, SessionState, SessionSummary,
    StackFrame, TerminalOutcome,
};
pub use identifiers::{PartyName, RunId, SessionId, SessionRole, TxHash};
pub use payload::{MessagePayload, Payload, PayloadTag, UntrustworthyPayload};
pub use protocol::{FlowInfo, ProtocolDescriptor};
