//! Collaborator effect interfaces
//!
//! The flow engine owns no I/O. Everything it needs from the outside world
//! is expressed as one of these traits and injected at node construction:
//!
//! - **Transport**: hand sequenced envelopes to a peer, receive them back
//! - **Identity**: resolve a party name to a routable network identity
//! - **Audit**: append-only audit sink plus permission evaluation
//! - **Finality**: terminal state of ledger transactions
//! - **Storage**: durable checkpoint store and stack snapshot sink
//! - **Wake**: notify the scheduler that a parked flow can make progress

pub mod audit;
pub mod finality;
pub mod identity;
pub mod storage;
pub mod transport;
pub mod wake;

pub use audit::{AuditError, AuditSink, PermissionEvaluator};
pub use finality::FinalityEffects;
pub use identity::{IdentityEffects, IdentityError, NetworkIdentity};
pub use storage::{CheckpointStore, SnapshotSink, StoreError};
pub use transport::{EnvelopeHandler, TransportEffects, TransportError};
pub use wake::FlowWaker;
