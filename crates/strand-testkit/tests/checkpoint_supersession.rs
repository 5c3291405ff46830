//! Checkpoint revisions
//!
//! Each run keeps only its newest checkpoint, revisions strictly increase,
//! and a save that does not advance the revision is refused.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;
use strand_core::{
    CheckpointStore, CommitOutcome, FlowInitiator, FlowState, StoreError, TerminalOutcome,
};
use strand_testkit::flows::{settlement_hash, OfferFlow, OfferResponder, Settlement};
use strand_testkit::{
    init_test_tracing, node_builder, output, start_node, wait_until, InMemoryNetwork,
    RecordingStore,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newer_checkpoints_supersede_older_ones() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let store = Arc::new(RecordingStore::new());
    let bank_a = start_node(
        &network,
        node_builder(&network, "O=Bank A")
            .register::<OfferFlow>()
            .with_store(store.clone())
            .with_retention(Duration::from_secs(600)),
    )
    .await?;
    let _bank_b = start_node(
        &network,
        node_builder(&network, "O=Bank B").register_responder::<OfferResponder>(),
    )
    .await?;

    let handle = bank_a
        .start_flow(OfferFlow::new("O=Bank B", "deal-9", 9), FlowInitiator::rpc("alice"))
        .await?;
    let run_id = handle.run_id();
    assert!(
        wait_until(|| bank_a
            .flow_status(run_id)
            .and_then(|s| s.pending)
            .is_some_and(|p| p.starts_with("ledger commit")))
        .await
    );
    bank_a.notify_commit(settlement_hash("deal-9", 9), CommitOutcome::Committed);
    let settlement: Settlement = output(&handle).await?;

    let history = store.history_of(run_id);
    assert!(history.len() >= 4);
    assert!(history.windows(2).all(|w| w[0].revision < w[1].revision));
    assert_eq!(history[0].state, FlowState::Created);

    let latest = store
        .load(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("terminal checkpoint not retained"))?;
    let last = history
        .last()
        .ok_or_else(|| anyhow::anyhow!("empty history"))?;
    assert_eq!(&latest, last);
    assert_eq!(latest.state, FlowState::Completed);
    match &latest.outcome {
        Some(TerminalOutcome::Completed(payload)) => {
            assert_eq!(payload.decode::<Settlement>()?, settlement);
        }
        other => anyhow::bail!("unexpected terminal outcome {other:?}"),
    }

    // Replaying an old revision is refused and leaves the newest in place.
    let stale = store.save(&history[1]).await.unwrap_err();
    assert!(matches!(stale, StoreError::StaleRevision { .. }));
    assert_eq!(store.load(run_id).await?.map(|c| c.revision), Some(latest.revision));
    Ok(())
}
