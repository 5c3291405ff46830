//! Unified error taxonomy for flow execution
//!
//! Every fatal condition a flow can hit resolves its result future with one
//! of these variants. The type is `Clone + Serialize` because the same cause
//! is observed by every result waiter and persisted in terminal checkpoints.

use crate::identifiers::{PartyName, RunId, SessionId, TxHash};
use crate::payload::PayloadTag;
use serde::{Deserialize, Serialize};

/// Broad classification used by operators and the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// The counterparty broke the protocol contract
    ProtocolViolation,
    /// Permission or validation failure
    Security,
    /// The ledger rejected a transaction the flow waited on
    Finality,
    /// A persisted checkpoint could not be rehydrated
    Recovery,
    /// Integration defect (resuming terminal instances and similar)
    Misuse,
    /// Storage, transport or encoding failure
    Infrastructure,
}

/// Unified error type for flow operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FlowError {
    /// The counterparty could not be resolved to a routable identity
    #[error("Cannot initiate session with {party}: {reason}")]
    SessionInitiation {
        /// Party the flow tried to reach
        party: PartyName,
        /// Why resolution failed
        reason: String,
    },

    /// A received message declared a different type than the flow expected
    #[error("Unexpected payload on {session}: expected {expected}, got {actual}")]
    UnexpectedPayloadType {
        /// Session the message arrived on
        session: SessionId,
        /// Type the flow was waiting for
        expected: PayloadTag,
        /// Type the message declared
        actual: PayloadTag,
    },

    /// Handshake negotiation produced incompatible protocol versions
    #[error("Incompatible version for {protocol}: local {local}, remote {remote}")]
    IncompatibleVersion {
        /// Protocol name announced in the handshake
        protocol: String,
        /// Local protocol version
        local: u32,
        /// Version offered or accepted by the counterparty
        remote: u32,
    },

    /// The counterparty refused the session for a reason other than version
    #[error("Session {session} rejected by counterparty: {reason}")]
    SessionRejected {
        /// Rejected session
        session: SessionId,
        /// Reason supplied by the counterparty
        reason: String,
    },

    /// The counterparty ended the session while the flow still needed it
    #[error("Session {session} ended by counterparty: {}", .reason.as_deref().unwrap_or("flow completed"))]
    SessionEnded {
        /// Ended session
        session: SessionId,
        /// Failure reported by the counterparty flow, if any
        reason: Option<String>,
    },

    /// The flow referenced a session it does not own or has closed
    #[error("Unknown or closed session {session}")]
    UnknownSession {
        /// Offending session
        session: SessionId,
    },

    /// The initiator lacks the permission named by `check_flow_permission`
    #[error("Permission denied: {principal} lacks {permission}")]
    PermissionDenied {
        /// Principal that started the flow
        principal: String,
        /// Permission that was checked
        permission: String,
    },

    /// Untrusted data failed the flow's explicit validation
    #[error("Validation failed: {reason}")]
    Validation {
        /// Validation failure description
        reason: String,
    },

    /// The ledger finality signal reported rejection
    #[error("Transaction {hash} rejected: {reason}")]
    TransactionRejected {
        /// Transaction the flow waited on
        hash: TxHash,
        /// Reason reported by the finality collaborator
        reason: String,
    },

    /// A persisted checkpoint could not be decoded or rehydrated
    #[error("Checkpoint for {run_id} is corrupt: {reason}")]
    CheckpointCorruption {
        /// Affected run
        run_id: RunId,
        /// Decoding or rehydration failure
        reason: String,
    },

    /// A terminal instance was asked to resume
    #[error("Stale resume of {run_id} in state {state}")]
    StaleResume {
        /// Affected run
        run_id: RunId,
        /// State the instance was in
        state: String,
    },

    /// The hosting node stopped before the flow resolved
    #[error("Flow {run_id} abandoned by its node; it resumes from its checkpoint on restart")]
    Abandoned {
        /// Affected run
        run_id: RunId,
    },

    /// Payload encoding or decoding failed
    #[error("Payload error: {message}")]
    Payload {
        /// Error message describing the encoding failure
        message: String,
    },

    /// Checkpoint store failure
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Transport failure while handing off an envelope
    #[error("Transport error: {message}")]
    Transport {
        /// Error message describing the transport failure
        message: String,
    },

    /// Audit sink failure on the permission-check path
    #[error("Audit error: {message}")]
    Audit {
        /// Error message describing the audit failure
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl FlowError {
    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Create a payload encoding error
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a checkpoint corruption error
    pub fn corruption(run_id: RunId, reason: impl Into<String>) -> Self {
        Self::CheckpointCorruption {
            run_id,
            reason: reason.into(),
        }
    }

    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            FlowError::UnexpectedPayloadType { .. }
            | FlowError::IncompatibleVersion { .. }
            | FlowError::SessionRejected { .. }
            | FlowError::SessionEnded { .. }
            | FlowError::UnknownSession { .. } => ErrorCategory::ProtocolViolation,
            FlowError::PermissionDenied { .. } | FlowError::Validation { .. } => {
                ErrorCategory::Security
            }
            FlowError::TransactionRejected { .. } => ErrorCategory::Finality,
            FlowError::CheckpointCorruption { .. } => ErrorCategory::Recovery,
            FlowError::StaleResume { .. } => ErrorCategory::Misuse,
            FlowError::SessionInitiation { .. }
            | FlowError::Abandoned { .. }
            | FlowError::Payload { .. }
            | FlowError::Storage { .. }
            | FlowError::Transport { .. }
            | FlowError::Audit { .. }
            | FlowError::Internal { .. } => ErrorCategory::Infrastructure,
        }
    }

    /// Short stable name of the variant, used in audit records and logs
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::SessionInitiation { .. } => "SessionInitiationError",
            FlowError::UnexpectedPayloadType { .. } => "UnexpectedPayloadTypeError",
            FlowError::IncompatibleVersion { .. } => "IncompatibleVersionError",
            FlowError::SessionRejected { .. } => "SessionRejectedError",
            FlowError::SessionEnded { .. } => "SessionEndedError",
            FlowError::UnknownSession { .. } => "UnknownSessionError",
            FlowError::PermissionDenied { .. } => "PermissionDeniedError",
            FlowError::Validation { .. } => "ValidationError",
            FlowError::TransactionRejected { .. } => "TransactionRejectedError",
            FlowError::CheckpointCorruption { .. } => "CheckpointCorruptionError",
            FlowError::StaleResume { .. } => "StaleResumeError",
            FlowError::Abandoned { .. } => "AbandonedError",
            FlowError::Payload { .. } => "PayloadError",
            FlowError::Storage { .. } => "StorageError",
            FlowError::Transport { .. } => "TransportError",
            FlowError::Audit { .. } => "AuditError",
            FlowError::Internal { .. } => "InternalError",
        }
    }
}

/// Standard Result type for flow operations
pub type FlowResult<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlowError::validation("amount must be positive");
        assert_eq!(err.to_string(), "Validation failed: amount must be positive");

        let ended = FlowError::SessionEnded {
            session: SessionId::new(),
            reason: None,
        };
        assert!(ended.to_string().ends_with("ended by counterparty: flow completed"));
    }

    #[test]
    fn test_error_categories() {
        let mismatch = FlowError::UnexpectedPayloadType {
            session: SessionId::new(),
            expected: PayloadTag::new("ack"),
            actual: PayloadTag::new("offer"),
        };
        assert_eq!(mismatch.category(), ErrorCategory::ProtocolViolation);
        assert_eq!(mismatch.kind(), "UnexpectedPayloadTypeError");

        let denied = FlowError::PermissionDenied {
            principal: "alice".into(),
            permission: "StartFlow.Issue".into(),
        };
        assert_eq!(denied.category(), ErrorCategory::Security);
        assert_eq!(
            FlowError::corruption(RunId::new(), "bad digest").category(),
            ErrorCategory::Recovery
        );
    }

    #[test]
    fn test_error_survives_serialization() {
        let err = FlowError::TransactionRejected {
            hash: TxHash::of(b"tx"),
            reason: "double spend".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: FlowError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
