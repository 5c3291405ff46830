//! Transport effect interface
//!
//! The transport delivers each envelope at least once and may duplicate,
//! but must keep the order of envelopes within one session. Duplicates are
//! dropped by the session layer using the sequence number each envelope
//! carries.

use crate::effects::identity::NetworkIdentity;
use crate::envelope::Envelope;
use crate::errors::FlowError;
use async_trait::async_trait;
use std::sync::Arc;

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The destination is not reachable right now
    #[error("Peer unreachable: {peer}")]
    Unreachable {
        /// Destination party
        peer: String,
    },
    /// The envelope could not be handed off
    #[error("Send failed: {reason}")]
    SendFailed {
        /// Reason for the failure
        reason: String,
    },
}

impl From<TransportError> for FlowError {
    fn from(err: TransportError) -> Self {
        FlowError::transport(err.to_string())
    }
}

/// Outbound half of the peer transport
#[async_trait]
pub trait TransportEffects: Send + Sync {
    /// Hand an envelope to the transport for delivery to `to`
    async fn send_envelope(&self, to: &NetworkIdentity, envelope: Envelope)
        -> Result<(), TransportError>;
}

/// Inbound half: whatever the transport delivers envelopes to
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Accept one envelope from the transport
    async fn deliver(&self, envelope: Envelope);
}

#[async_trait]
impl<T: TransportEffects + ?Sized> TransportEffects for Arc<T> {
    async fn send_envelope(
        &self,
        to: &NetworkIdentity,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        (**self).send_envelope(to, envelope).await
    }
}
