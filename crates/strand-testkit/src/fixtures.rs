//! Node fixtures for integration tests

use crate::network::InMemoryNetwork;
use std::sync::Arc;
use std::time::Duration;
use strand_core::{EnvelopeHandler, FlowError, FlowResult, MessagePayload};
use strand_flow::{FlowHandle, FlowOutcome};
use strand_runtime::{FlowNode, FlowNodeBuilder, NodeError};
use tracing_subscriber::EnvFilter;

/// How long helpers wait before giving up
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Install a test-friendly subscriber once; honours `RUST_LOG`
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builder for a node named `identity` that talks over `network`
///
/// The network doubles as the node's address book.
pub fn node_builder(network: &InMemoryNetwork, identity: &str) -> FlowNodeBuilder {
    network.register(identity);
    FlowNodeBuilder::with_identity_name(identity)
        .with_transport(network.transport())
        .with_identity(network.directory())
}

/// Build the node and attach it to `network`
pub async fn start_node(
    network: &InMemoryNetwork,
    builder: FlowNodeBuilder,
) -> Result<Arc<FlowNode>, NodeError> {
    let node = builder.build().await?;
    let handler: Arc<dyn EnvelopeHandler> = node.clone();
    network.attach(node.identity().clone(), &handler);
    Ok(node)
}

/// Stop `node` and cut it off the network; envelopes for it queue up
pub fn crash(network: &InMemoryNetwork, node: &FlowNode) {
    node.shutdown();
    network.detach(node.identity());
}

/// Poll `condition` until it holds or [`WAIT_LIMIT`] passes
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    condition()
}

/// Wait for a flow, failing with an internal error after [`WAIT_LIMIT`]
pub async fn outcome(handle: &FlowHandle) -> FlowOutcome {
    tokio::time::timeout(WAIT_LIMIT, handle.result())
        .await
        .unwrap_or_else(|_| {
            Err(FlowError::internal(format!(
                "{} did not resolve in time",
                handle.run_id()
            )))
        })
}

/// [`outcome`] decoded as `T`
pub async fn output<T: MessagePayload>(handle: &FlowHandle) -> FlowResult<T> {
    outcome(handle).await?.decode::<T>()
}
