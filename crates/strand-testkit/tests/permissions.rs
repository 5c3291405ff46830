//! Permission checks inside flows
//!
//! Every check writes exactly one audit record, granted or not, including
//! checks made by a flow resumed from its checkpoint after a restart.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use strand_core::{AuditKind, CommitOutcome, FlowError, FlowInitiator, FlowState, TxHash};
use strand_runtime::{NodeConfig, PermissionTable, ALL_PERMISSIONS};
use strand_store::MemoryCheckpointStore;
use strand_testkit::flows::{GuardedIssue, GuardedSettlement, ISSUE_PERMISSION, SETTLE_PERMISSION};
use strand_testkit::{
    crash, init_test_tracing, node_builder, outcome, output, start_node, wait_until,
    InMemoryNetwork, RecordingAuditSink,
};

const ISSUER: &str = "O=Issuer";

async fn issuer(
    network: &InMemoryNetwork,
    audit: &Arc<RecordingAuditSink>,
) -> anyhow::Result<Arc<strand_runtime::FlowNode>> {
    let permissions = PermissionTable::new().grant("alice", ISSUE_PERMISSION);
    Ok(start_node(
        network,
        node_builder(network, ISSUER)
            .register::<GuardedIssue>()
            .with_audit(audit.clone())
            .with_permissions(Arc::new(permissions)),
    )
    .await?)
}

#[tokio::test]
async fn granted_permission_is_audited_once() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let audit = Arc::new(RecordingAuditSink::new());
    let node = issuer(&network, &audit).await?;

    let handle = node
        .start_flow(GuardedIssue { amount: 40 }, FlowInitiator::rpc("alice"))
        .await?;
    let issued: u64 = output(&handle).await?;
    assert_eq!(issued, 40);

    let checks = audit.permission_checks(handle.run_id());
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].principal, "alice");
    assert_eq!(
        checks[0].kind,
        AuditKind::PermissionCheck {
            permission: ISSUE_PERMISSION.to_string(),
            granted: true,
        }
    );
    assert_eq!(checks[0].data.get("amount").map(String::as_str), Some("40"));
    assert!(audit.failures(handle.run_id()).is_empty());
    Ok(())
}

#[tokio::test]
async fn denied_permission_fails_the_flow() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let audit = Arc::new(RecordingAuditSink::new());
    let node = issuer(&network, &audit).await?;

    let handle = node
        .start_flow(GuardedIssue { amount: 40 }, FlowInitiator::rpc("mallory"))
        .await?;
    match outcome(&handle).await {
        Err(FlowError::PermissionDenied {
            principal,
            permission,
        }) => {
            assert_eq!(principal, "mallory");
            assert_eq!(permission, ISSUE_PERMISSION);
        }
        other => anyhow::bail!("expected a permission denial, got {other:?}"),
    }

    let checks = audit.permission_checks(handle.run_id());
    assert_eq!(checks.len(), 1);
    assert!(matches!(
        checks[0].kind,
        AuditKind::PermissionCheck { granted: false, .. }
    ));
    assert_eq!(audit.failures(handle.run_id()).len(), 1);
    Ok(())
}

#[tokio::test]
async fn unavailable_audit_log_fails_the_check() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let audit = Arc::new(RecordingAuditSink::new());
    let node = issuer(&network, &audit).await?;
    audit.set_failing(true);

    let handle = node
        .start_flow(GuardedIssue { amount: 1 }, FlowInitiator::rpc("alice"))
        .await?;
    assert!(matches!(
        outcome(&handle).await,
        Err(FlowError::Audit { .. })
    ));
    assert!(audit.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn configured_grants_apply() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    network.register(ISSUER);
    let mut config = NodeConfig::default();
    config.node.identity = ISSUER.to_string();
    config.permissions = BTreeMap::from([("ops".to_string(), vec![ALL_PERMISSIONS.to_string()])]);
    let audit = Arc::new(RecordingAuditSink::new());
    let node = start_node(
        &network,
        strand_runtime::FlowNodeBuilder::new(config)
            .with_transport(network.transport())
            .with_identity(network.directory())
            .with_audit(audit.clone())
            .register::<GuardedIssue>(),
    )
    .await?;

    let granted = node
        .start_flow(GuardedIssue { amount: 3 }, FlowInitiator::rpc("ops"))
        .await?;
    let denied = node
        .start_flow(GuardedIssue { amount: 3 }, FlowInitiator::rpc("alice"))
        .await?;
    assert_eq!(output::<u64>(&granted).await?, 3);
    assert!(outcome(&denied).await.is_err());
    assert_eq!(audit.permission_checks(granted.run_id()).len(), 1);
    assert_eq!(audit.permission_checks(denied.run_id()).len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_flow_is_denied_and_audited_once() -> anyhow::Result<()> {
    init_test_tracing();
    let network = InMemoryNetwork::new();
    let store = Arc::new(MemoryCheckpointStore::new());
    let audit_before = Arc::new(RecordingAuditSink::new());
    let node = start_node(
        &network,
        node_builder(&network, ISSUER)
            .register::<GuardedSettlement>()
            .with_store(store.clone())
            .with_audit(audit_before.clone()),
    )
    .await?;

    let hash = TxHash::of(b"settle 70 EUR");
    let handle = node
        .start_flow(GuardedSettlement::new(hash), FlowInitiator::rpc("mallory"))
        .await?;
    let run_id = handle.run_id();
    assert!(wait_until(|| node.flow_status(run_id).map(|s| s.state) == Some(FlowState::Suspended)).await);
    crash(&network, &node);

    let audit = Arc::new(RecordingAuditSink::new());
    let permissions = PermissionTable::new().grant("alice", SETTLE_PERMISSION);
    let restarted = start_node(
        &network,
        node_builder(&network, ISSUER)
            .register::<GuardedSettlement>()
            .with_store(store.clone())
            .with_audit(audit.clone())
            .with_permissions(Arc::new(permissions)),
    )
    .await?;
    let report = restarted.recover().await?;
    assert_eq!(report.resumed, vec![run_id]);

    restarted.notify_commit(hash, CommitOutcome::Committed);
    let resumed = restarted
        .flow_handle(run_id)
        .ok_or_else(|| anyhow::anyhow!("no handle for the resumed run"))?;
    match outcome(&resumed).await {
        Err(FlowError::PermissionDenied {
            principal,
            permission,
        }) => {
            assert_eq!(principal, "mallory");
            assert_eq!(permission, SETTLE_PERMISSION);
        }
        other => anyhow::bail!("expected a permission denial, got {other:?}"),
    }

    let checks = audit.permission_checks(run_id);
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].principal, "mallory");
    assert_eq!(
        checks[0].kind,
        AuditKind::PermissionCheck {
            permission: SETTLE_PERMISSION.to_string(),
            granted: false,
        }
    );
    assert_eq!(audit.failures(run_id).len(), 1);
    assert!(audit_before.permission_checks(run_id).is_empty());
    Ok(())
}
