//! # Strand Testkit
//!
//! Shared test infrastructure for Strand nodes:
//!
//! - [`network`]: an in-memory peer network with delivery control
//! - [`collaborators`]: recording audit sink, recording checkpoint store and
//!   a scriptable ledger
//! - [`fixtures`]: node construction, crash simulation and wait helpers
//! - [`flows`]: sample protocols used by the integration tests

pub mod collaborators;
pub mod fixtures;
pub mod flows;
pub mod network;

pub use collaborators::{store_with, RecordingAuditSink, RecordingStore, ScriptedLedger};
pub use fixtures::{
    crash, init_test_tracing, node_builder, outcome, output, start_node, wait_until, WAIT_LIMIT,
};
pub use network::{InMemoryNetwork, SentEnvelope};
