//! Offer settlement between two nodes
//!
//! Covers the full life of a two-party flow: session handshake, a retried
//! send, ledger finality, a crash between the hand-off of an envelope and
//! the checkpoint recording it, and duplicate suppression on the receiving
//! side.

#![allow(missing_docs)]

use std::sync::Arc;
use strand_core::{
    CommitOutcome, FlowError, FlowInitiator, FlowState, PartyName, PayloadTag, RunId,
};
use strand_runtime::{FlowNode, NodeConfig};
use strand_testkit::flows::{settlement_hash, Ack, Offer, OfferFlow, OfferResponder, Settlement};
use strand_testkit::{
    crash, init_test_tracing, node_builder, outcome, output, start_node, store_with, wait_until,
    InMemoryNetwork, RecordingStore,
};

const BANK_A: &str = "O=Bank A";
const BANK_B: &str = "O=Bank B";

fn waiting_for_commit(node: &FlowNode, run_id: RunId) -> bool {
    node.flow_status(run_id)
        .and_then(|status| status.pending)
        .is_some_and(|pending| pending.starts_with("ledger commit"))
}

async fn bank_b(network: &InMemoryNetwork) -> anyhow::Result<Arc<FlowNode>> {
    Ok(start_node(network, node_builder(network, BANK_B).register_responder::<OfferResponder>()).await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offer_settles_once_the_ledger_commits() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let bank_a = start_node(&network, node_builder(&network, BANK_A).register::<OfferFlow>()).await?;
    let bank_b = bank_b(&network).await?;

    let handle = bank_a
        .start_flow(OfferFlow::new(BANK_B, "deal-1", 100), FlowInitiator::rpc("alice"))
        .await?;
    let run_id = handle.run_id();
    assert!(wait_until(|| waiting_for_commit(&bank_a, run_id)).await);
    assert!(handle.try_result().is_none());

    // A second copy of the acknowledgement is dropped by sequence number.
    let ack = network
        .sent_to(&PartyName::new(BANK_A))
        .into_iter()
        .find(|e| e.declared_type() == Some(&PayloadTag::of::<Ack>()))
        .ok_or_else(|| anyhow::anyhow!("no ack sent"))?;
    let duplicates = bank_a.session_stats().duplicates;
    assert!(network.redeliver(&PartyName::new(BANK_A), ack).await);
    assert_eq!(bank_a.session_stats().duplicates, duplicates + 1);
    assert!(waiting_for_commit(&bank_a, run_id));

    let hash = settlement_hash("deal-1", 100);
    bank_a.notify_commit(hash, CommitOutcome::Committed);
    let settlement: Settlement = output(&handle).await?;
    assert_eq!(settlement, Settlement { hash, amount: 100 });

    assert!(wait_until(|| bank_b.flows_in_state(FlowState::Completed).len() == 1).await);
    assert_eq!(
        bank_a.flow_status(run_id).map(|s| s.state),
        Some(FlowState::Completed)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_transaction_fails_the_offer() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let bank_a = start_node(&network, node_builder(&network, BANK_A).register::<OfferFlow>()).await?;
    let bank_b = bank_b(&network).await?;

    let handle = bank_a
        .start_flow(OfferFlow::new(BANK_B, "deal-2", 7), FlowInitiator::rpc("alice"))
        .await?;
    assert!(wait_until(|| waiting_for_commit(&bank_a, handle.run_id())).await);

    bank_a.notify_commit(
        settlement_hash("deal-2", 7),
        CommitOutcome::Rejected {
            reason: "double spend".into(),
        },
    );
    let err = outcome(&handle).await.unwrap_err();
    assert!(matches!(err, FlowError::TransactionRejected { .. }));

    // The responder learns about the failure through the session end.
    assert!(wait_until(|| bank_b.flows_in_state(FlowState::Failed).len() == 1).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_after_hand_off_replays_without_duplicating_effects() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let store = Arc::new(RecordingStore::new());
    let bank_a = start_node(
        &network,
        node_builder(&network, BANK_A)
            .register::<OfferFlow>()
            .with_store(store.clone()),
    )
    .await?;
    let bank_b = bank_b(&network).await?;
    let bank_b_party = PartyName::new(BANK_B);
    network.hold(BANK_B);

    let handle = bank_a
        .start_flow(OfferFlow::new(BANK_B, "deal-3", 250), FlowInitiator::rpc("alice"))
        .await?;
    let run_id = handle.run_id();
    // Init and Offer are in flight.
    assert!(wait_until(|| network.queued(&bank_b_party) == 2).await);

    // Restart from the checkpoint taken just before the hand-off.
    let before_hand_off = store
        .history_of(run_id)
        .into_iter()
        .rev()
        .find(|checkpoint| !checkpoint.outbox.is_empty())
        .ok_or_else(|| anyhow::anyhow!("no checkpoint with queued sends"))?;
    assert!(before_hand_off.retry_send.is_some());
    crash(&network, &bank_a);
    assert!(matches!(
        outcome(&handle).await,
        Err(FlowError::Abandoned { .. })
    ));

    let restarted = start_node(
        &network,
        node_builder(&network, BANK_A)
            .register::<OfferFlow>()
            .with_store(Arc::new(store_with(&[before_hand_off]).await?)),
    )
    .await?;
    let report = restarted.recover().await?;
    assert_eq!(report.resumed, vec![run_id]);
    assert_eq!(network.queued(&bank_b_party), 4);

    assert_eq!(network.release(&bank_b_party).await, 4);
    assert_eq!(bank_b.session_stats().duplicates, 2);
    let offers: Vec<u64> = network
        .sent_to(&bank_b_party)
        .iter()
        .filter(|e| e.declared_type() == Some(&PayloadTag::of::<Offer>()))
        .map(|e| e.sequence)
        .collect();
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[0], offers[1]);

    assert!(wait_until(|| waiting_for_commit(&restarted, run_id)).await);
    let hash = settlement_hash("deal-3", 250);
    restarted.notify_commit(hash, CommitOutcome::Committed);
    let handle = restarted
        .flow_handle(run_id)
        .ok_or_else(|| anyhow::anyhow!("recovered flow has no handle"))?;
    let settlement: Settlement = output(&handle).await?;
    assert_eq!(settlement.amount, 250);

    // Exactly one responder ran on Bank B.
    assert!(wait_until(|| bank_b.flows_in_state(FlowState::Completed).len() == 1).await);
    assert!(bank_b.flows_in_state(FlowState::Failed).is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flow_resumes_from_disk_after_restart() -> anyhow::Result<()> {
    init_test_tracing();
    let dir = tempfile::tempdir()?;
    let network = InMemoryNetwork::new();
    let config = || {
        let mut config = NodeConfig::default();
        config.node.identity = BANK_A.to_string();
        config.checkpoints.directory = Some(dir.path().join("checkpoints"));
        config
    };
    let builder = || {
        network.register(BANK_A);
        strand_runtime::FlowNodeBuilder::new(config())
            .with_transport(network.transport())
            .with_identity(network.directory())
            .register::<OfferFlow>()
    };

    let bank_a = start_node(&network, builder()).await?;
    let bank_b = bank_b(&network).await?;
    let handle = bank_a
        .start_flow(OfferFlow::new(BANK_B, "deal-4", 12), FlowInitiator::rpc("alice"))
        .await?;
    let run_id = handle.run_id();
    assert!(wait_until(|| waiting_for_commit(&bank_a, run_id)).await);
    crash(&network, &bank_a);

    let restarted = start_node(&network, builder()).await?;
    let report = restarted.recover().await?;
    assert_eq!(report.resumed, vec![run_id]);
    assert!(report.failed.is_empty());
    assert!(wait_until(|| waiting_for_commit(&restarted, run_id)).await);

    restarted.notify_commit(settlement_hash("deal-4", 12), CommitOutcome::Committed);
    let handle = restarted
        .flow_handle(run_id)
        .ok_or_else(|| anyhow::anyhow!("recovered flow has no handle"))?;
    let settlement: Settlement = output(&handle).await?;
    assert_eq!(settlement.amount, 12);
    assert!(wait_until(|| bank_b.flows_in_state(FlowState::Completed).len() == 1).await);
    Ok(())
}
