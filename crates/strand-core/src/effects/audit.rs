//! Audit and permission interfaces

use crate::errors::FlowError;
use crate::flow::{AuditRecord, FlowInitiator};

/// Audit sink failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Audit sink failed: {reason}")]
pub struct AuditError {
    /// Reason for the failure
    pub reason: String,
}

impl AuditError {
    /// Create an audit error
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<AuditError> for FlowError {
    fn from(err: AuditError) -> Self {
        FlowError::Audit { message: err.reason }
    }
}

/// Append-only audit log
pub trait AuditSink: Send + Sync {
    /// Append one record
    fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Decides whether a flow initiator holds a named permission
pub trait PermissionEvaluator: Send + Sync {
    /// Whether `initiator` holds `permission`
    fn has_permission(&self, initiator: &FlowInitiator, permission: &str) -> bool;
}
