//! # Strand Session
//!
//! Routing and ordering for flow sessions.
//!
//! - [`dedup`]: per-session outbound sequencing and inbound de-duplication
//! - [`registry`]: the node-wide session table, handshake handling and
//!   inbound buffering
//!
//! The registry never owns flow instances. Each entry is a route from
//! `(session id, local role)` to the run id of the owning flow plus the
//! messages that arrived before that flow reached its receive point.

pub mod dedup;
pub mod registry;

pub use dedup::{Admission, InboundDeduplicator, OutboundSequencer};
pub use registry::{
    DeliveryOutcome, HandshakeStatus, RegistryStats, SessionKey, SessionPoll, SessionRegistry,
    SessionView,
};
