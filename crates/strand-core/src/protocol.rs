//! Protocol descriptors and handshake version negotiation

use crate::errors::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name and supported version range of a flow protocol
///
/// The initiating side announces `name` and `version` in its session
/// handshake. A responder registered for `name` accepts when the announced
/// version is at least its `min_version`; the negotiated version is the
/// lower of the two current versions, and the initiator in turn refuses a
/// negotiated version below its own `min_version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    /// Protocol name, shared by initiator and responder
    pub name: String,
    /// Current version spoken by this side
    pub version: u32,
    /// Oldest version this side still understands
    pub min_version: u32,
}

impl ProtocolDescriptor {
    /// Descriptor that only understands `version`
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            min_version: version,
        }
    }

    /// Extend the range of versions this side understands
    pub fn with_min_version(mut self, min_version: u32) -> Self {
        self.min_version = min_version.min(self.version);
        self
    }

    /// Whether `version` falls inside the supported range
    pub fn supports(&self, version: u32) -> bool {
        version >= self.min_version && version <= self.version
    }

    /// Responder-side negotiation against the version announced by an
    /// initiator
    pub fn negotiate(&self, announced: u32) -> FlowResult<u32> {
        if announced < self.min_version {
            return Err(FlowError::IncompatibleVersion {
                protocol: self.name.clone(),
                local: self.version,
                remote: announced,
            });
        }
        Ok(announced.min(self.version))
    }

    /// Initiator-side check of the version the responder settled on
    pub fn accept_negotiated(&self, negotiated: u32) -> FlowResult<u32> {
        if self.supports(negotiated) {
            Ok(negotiated)
        } else {
            Err(FlowError::IncompatibleVersion {
                protocol: self.name.clone(),
                local: self.version,
                remote: negotiated,
            })
        }
    }
}

impl fmt::Display for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Counterparty protocol information learned from a completed handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowInfo {
    /// Protocol spoken on the session
    pub protocol: String,
    /// Version both sides agreed on
    pub version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_negotiates_lowest_common_version() {
        let responder = ProtocolDescriptor::new("settle", 3).with_min_version(2);
        assert_eq!(responder.negotiate(5).unwrap(), 3);
        assert_eq!(responder.negotiate(2).unwrap(), 2);
        assert!(matches!(
            responder.negotiate(1),
            Err(FlowError::IncompatibleVersion { local: 3, remote: 1, .. })
        ));
    }

    #[test]
    fn initiator_refuses_versions_below_its_minimum() {
        let initiator = ProtocolDescriptor::new("settle", 4).with_min_version(3);
        assert_eq!(initiator.accept_negotiated(3).unwrap(), 3);
        assert!(initiator.accept_negotiated(2).is_err());
    }

    #[test]
    fn min_version_is_clamped_to_version() {
        let descriptor = ProtocolDescriptor::new("settle", 1).with_min_version(7);
        assert_eq!(descriptor.min_version, 1);
        assert_eq!(descriptor.to_string(), "settle@1");
    }
}
