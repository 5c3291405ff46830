//! Identity service interface

use crate::errors::FlowError;
use crate::identifiers::PartyName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Routable identity of a party
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// Well-known name
    pub party: PartyName,
    /// Transport address
    pub address: String,
}

impl NetworkIdentity {
    /// Create an identity
    pub fn new(party: impl Into<PartyName>, address: impl Into<String>) -> Self {
        Self {
            party: party.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.party, self.address)
    }
}

/// Identity resolution failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// No identity is known for the party
    #[error("Unknown party: {party}")]
    UnknownParty {
        /// Requested party
        party: PartyName,
    },
    /// The identity service itself failed
    #[error("Identity service unavailable: {reason}")]
    Unavailable {
        /// Reason for the failure
        reason: String,
    },
}

impl From<IdentityError> for FlowError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownParty { party } => FlowError::SessionInitiation {
                party,
                reason: "unknown party".to_string(),
            },
            IdentityError::Unavailable { reason } => FlowError::internal(reason),
        }
    }
}

/// Resolves party names to routable identities
pub trait IdentityEffects: Send + Sync {
    /// Resolve `party`
    fn resolve(&self, party: &PartyName) -> Result<NetworkIdentity, IdentityError>;
}
