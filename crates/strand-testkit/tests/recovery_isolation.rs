//! Recovery after a restart
//!
//! A broken checkpoint fails only its own flow; every other in-flight flow
//! resumes where it left off.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;
use strand_core::{
    CheckpointStore, CommitOutcome, FlowError, FlowInitiator, FlowState, TxHash,
};
use strand_store::{MemoryCheckpointStore, MemorySnapshotSink};
use strand_testkit::flows::SnapshotAfterCommit;
use strand_testkit::{
    crash, init_test_tracing, node_builder, outcome, output, start_node, wait_until,
    InMemoryNetwork, ScriptedLedger,
};

const NODE: &str = "O=Notary";

fn waiter(tag: &str) -> (SnapshotAfterCommit, TxHash) {
    let hash = TxHash::of(tag.as_bytes());
    (
        SnapshotAfterCommit {
            hash,
            waiting: false,
        },
        hash,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_checkpoint_fails_only_its_flow() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let node = start_node(
        &network,
        node_builder(&network, NODE)
            .register::<SnapshotAfterCommit>()
            .with_store(store.clone()),
    )
    .await?;

    let (healthy, healthy_hash) = waiter("healthy");
    let (broken, _) = waiter("broken");
    let healthy = node.start_flow(healthy, FlowInitiator::rpc("ops")).await?;
    let broken = node.start_flow(broken, FlowInitiator::rpc("ops")).await?;
    assert!(wait_until(|| node.flows_in_state(FlowState::Suspended).len() == 2).await);
    crash(&network, &node);

    store.insert_raw(broken.run_id(), b"definitely not a checkpoint".to_vec());

    let restarted = start_node(
        &network,
        node_builder(&network, NODE)
            .register::<SnapshotAfterCommit>()
            .with_store(store.clone()),
    )
    .await?;
    let report = restarted.recover().await?;
    assert_eq!(report.resumed, vec![healthy.run_id()]);
    assert_eq!(report.corrupt(), vec![broken.run_id()]);
    assert_eq!(report.total(), 2);

    let failed = restarted
        .flow_handle(broken.run_id())
        .ok_or_else(|| anyhow::anyhow!("no handle for the broken run"))?;
    assert!(matches!(
        outcome(&failed).await,
        Err(FlowError::CheckpointCorruption { .. })
    ));
    assert_eq!(
        restarted.flow_status(broken.run_id()).map(|s| s.state),
        Some(FlowState::Failed)
    );

    restarted.notify_commit(healthy_hash, CommitOutcome::Committed);
    let resumed = restarted
        .flow_handle(healthy.run_id())
        .ok_or_else(|| anyhow::anyhow!("no handle for the healthy run"))?;
    let hex: String = output(&resumed).await?;
    assert_eq!(hex, healthy_hash.to_hex());

    // The broken bytes stay for an operator to inspect.
    assert!(store.load(broken.run_id()).await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistered_flow_is_reported_not_resumed() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let node = start_node(
        &network,
        node_builder(&network, NODE)
            .register::<SnapshotAfterCommit>()
            .with_store(store.clone()),
    )
    .await?;
    let (logic, _) = waiter("orphan");
    let handle = node.start_flow(logic, FlowInitiator::rpc("ops")).await?;
    assert!(wait_until(|| node.flows_in_state(FlowState::Suspended).len() == 1).await);
    crash(&network, &node);

    let restarted = start_node(&network, node_builder(&network, NODE).with_store(store)).await?;
    let report = restarted.recover().await?;
    assert!(report.resumed.is_empty());
    assert_eq!(report.corrupt(), vec![handle.run_id()]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_flow_sees_commit_that_landed_while_down() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let ledger = Arc::new(ScriptedLedger::new());
    let snapshots = Arc::new(MemorySnapshotSink::new());
    let node = start_node(
        &network,
        node_builder(&network, NODE)
            .register::<SnapshotAfterCommit>()
            .with_store(store.clone()),
    )
    .await?;
    let (logic, hash) = waiter("landed");
    let handle = node.start_flow(logic, FlowInitiator::rpc("ops")).await?;
    assert!(wait_until(|| node.flows_in_state(FlowState::Suspended).len() == 1).await);
    crash(&network, &node);

    ledger.commit(hash);
    let restarted = start_node(
        &network,
        node_builder(&network, NODE)
            .register::<SnapshotAfterCommit>()
            .with_store(store.clone())
            .with_ledger(ledger)
            .with_snapshots(snapshots.clone()),
    )
    .await?;
    restarted.recover().await?;
    let resumed = restarted
        .flow_handle(handle.run_id())
        .ok_or_else(|| anyhow::anyhow!("no handle for the resumed run"))?;
    let hex: String = output(&resumed).await?;
    assert_eq!(hex, hash.to_hex());

    let taken = snapshots.snapshots();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].run_id, handle.run_id());
    assert_eq!(taken[0].flow_name, "demo.snapshot-after-commit");
    assert!(!taken[0].frames.is_empty());

    // Retention is zero, so the finished flow leaves nothing behind.
    assert!(wait_until(|| store.is_empty()).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retained_outcome_survives_restart() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let builder = || {
        node_builder(&network, NODE)
            .register::<SnapshotAfterCommit>()
            .with_store(store.clone())
            .with_retention(Duration::from_secs(3600))
    };
    let node = start_node(&network, builder()).await?;
    let (logic, hash) = waiter("retained");
    let handle = node.start_flow(logic, FlowInitiator::rpc("ops")).await?;
    assert!(wait_until(|| node.flows_in_state(FlowState::Suspended).len() == 1).await);
    node.notify_commit(hash, CommitOutcome::Committed);
    let first: String = output(&handle).await?;
    crash(&network, &node);

    let restarted = start_node(&network, builder()).await?;
    let report = restarted.recover().await?;
    assert_eq!(report.retained, vec![handle.run_id()]);
    let replayed = restarted
        .flow_handle(handle.run_id())
        .ok_or_else(|| anyhow::anyhow!("no handle for the retained run"))?;
    let second: String = output(&replayed).await?;
    assert_eq!(first, second);
    assert_eq!(
        restarted.flow_status(handle.run_id()).map(|s| s.state),
        Some(FlowState::Completed)
    );
    Ok(())
}
