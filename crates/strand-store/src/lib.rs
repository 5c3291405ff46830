//! # Strand Store
//!
//! Checkpoint persistence for the flow engine.
//!
//! Checkpoints are encoded as CBOR behind a fixed header carrying a BLAKE3
//! digest of the body, so torn or tampered bytes are detected on load and
//! surface as [`StoreError::Corrupt`](strand_core::StoreError::Corrupt)
//! instead of rehydrating garbage.
//!
//! - [`MemoryCheckpointStore`]: process-local store for tests and simulations
//! - [`FilesystemCheckpointStore`]: one file per run, replaced atomically
//! - [`FilesystemSnapshotSink`] / [`MemorySnapshotSink`]: stack snapshot sinks

pub mod codec;
pub mod filesystem;
pub mod memory;
pub mod snapshot;

pub use codec::{decode_checkpoint, encode_checkpoint};
pub use filesystem::FilesystemCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use snapshot::{FilesystemSnapshotSink, MemorySnapshotSink};

#[cfg(test)]
pub(crate) mod test_support {
    use strand_core::{
        Checkpoint, FlowInitiator, FlowState, PartyName, PayloadTag, PendingWait,
        ProtocolDescriptor, RunId, SessionId, SessionRecord, SessionRole, SessionState,
    };

    pub fn checkpoint(run_id: RunId, revision: u64) -> Checkpoint {
        let session = SessionId::new();
        Checkpoint {
            run_id,
            revision,
            flow_name: "test.offer".to_string(),
            protocol: ProtocolDescriptor::new("test.offer", 1),
            initiator: FlowInitiator::rpc("alice"),
            state: FlowState::Suspended,
            logic_state: vec![1, 2, 3],
            sessions: vec![SessionRecord {
                id: session,
                role: SessionRole::Initiator,
                counterparty: PartyName::new("O=Bank B"),
                protocol: ProtocolDescriptor::new("test.offer", 1),
                state: SessionState::Established,
                negotiated_version: Some(1),
                next_outbound: 2,
                last_received: 0,
            }],
            pending: Some(PendingWait::Receive {
                session,
                expected: PayloadTag::new("test.ack"),
            }),
            outbox: Vec::new(),
            retry_send: None,
            outcome: None,
            trail: vec!["await-ack".to_string()],
            created_at_ms: 1,
            checkpointed_at_ms: 2,
        }
    }
}
