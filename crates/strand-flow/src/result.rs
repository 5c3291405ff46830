//! Flow result futures
//!
//! Each flow resolves exactly once. The resolving side holds a
//! [`ResultSlot`]; any number of [`FlowHandle`] clones observe the same
//! value. If the slot is dropped unresolved (the node shut down) every
//! waiter sees [`FlowError::Abandoned`].

use futures::future::{BoxFuture, FutureExt, Shared};
use strand_core::{FlowError, FlowResult, MessagePayload, Payload, RunId};
use tokio::sync::oneshot;

/// Final value of a flow: its encoded output or its failure cause
pub type FlowOutcome = Result<Payload, FlowError>;

/// Resolving half of a flow result
#[derive(Debug)]
pub struct ResultSlot {
    run_id: RunId,
    sender: Option<oneshot::Sender<FlowOutcome>>,
}

impl ResultSlot {
    /// Resolve the flow; returns `false` if it was already resolved
    pub fn resolve(&mut self, outcome: FlowOutcome) -> bool {
        match self.sender.take() {
            Some(sender) => {
                // Nobody listening is fine; the outcome is also in the table.
                let _ = sender.send(outcome);
                true
            }
            None => {
                tracing::warn!(run_id = %self.run_id, "Ignoring second resolution of flow result");
                false
            }
        }
    }

    /// Whether the slot has been resolved
    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }
}

/// Awaitable, cloneable handle to a flow's result
#[derive(Clone)]
pub struct FlowHandle {
    run_id: RunId,
    result: Shared<BoxFuture<'static, FlowOutcome>>,
}

impl FlowHandle {
    /// Run the handle belongs to
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Wait for the flow to resolve
    pub async fn result(&self) -> FlowOutcome {
        self.result.clone().await
    }

    /// Wait for the flow and decode its output as `T`
    pub async fn result_as<T: MessagePayload>(&self) -> FlowResult<T> {
        self.result().await?.decode::<T>()
    }

    /// The outcome if the flow already resolved
    pub fn try_result(&self) -> Option<FlowOutcome> {
        self.result.clone().now_or_never()
    }

    /// Handle that is already resolved with `outcome`
    pub fn resolved(run_id: RunId, outcome: FlowOutcome) -> Self {
        let (mut slot, handle) = result_channel(run_id);
        slot.resolve(outcome);
        handle
    }
}

impl std::fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandle")
            .field("run_id", &self.run_id)
            .field("resolved", &self.result.peek().is_some())
            .finish()
    }
}

/// Create the two halves of a flow result
pub fn result_channel(run_id: RunId) -> (ResultSlot, FlowHandle) {
    let (sender, receiver) = oneshot::channel();
    let result = receiver
        .map(move |received| received.unwrap_or(Err(FlowError::Abandoned { run_id })))
        .boxed()
        .shared();
    (
        ResultSlot {
            run_id,
            sender: Some(sender),
        },
        FlowHandle { run_id, result },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_waiter_sees_the_same_value() {
        let run_id = RunId::new();
        let (mut slot, handle) = result_channel(run_id);
        let other = handle.clone();
        assert!(handle.try_result().is_none());

        assert!(slot.resolve(Ok(Payload::encode(&42u64).unwrap())));
        assert!(!slot.resolve(Err(FlowError::internal("late"))));

        assert_eq!(handle.result_as::<u64>().await.unwrap(), 42);
        assert_eq!(other.result_as::<u64>().await.unwrap(), 42);
        assert!(other.try_result().is_some());
    }

    #[tokio::test]
    async fn dropped_slot_abandons() {
        let run_id = RunId::new();
        let (slot, handle) = result_channel(run_id);
        drop(slot);
        assert_eq!(handle.result().await, Err(FlowError::Abandoned { run_id }));
    }
}
