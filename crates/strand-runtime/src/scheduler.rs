//! Bounded flow scheduler
//!
//! At most `max_workers` flows execute a step at any moment; the bound is a
//! [`Semaphore`] whose permits are held only for the duration of one
//! activation. A flow that parks gives its permit back and moves to the
//! parking lot, where it occupies no worker until it is woken.
//!
//! Wakes come from the node: an inbound envelope routed to a flow, or a
//! ledger finality signal. A wake for a flow that is still running is
//! remembered and the flow is re-polled as soon as it parks, so a message
//! that lands between "nothing buffered" and "parked" is never missed.
//!
//! A flow that parks with envelopes the transport refused is woken again
//! after the redelivery delay, so hand-off is retried even when nothing
//! else would wake it.
//!
//! The scheduler does not look at flow results. Resolved flows only leave
//! behind a retention timer for their terminal checkpoint.

use crate::task_registry::TaskRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strand_core::{CheckpointStore, FlowWaker, RunId};
use strand_flow::{Activation, FlowStateMachine};
use tokio::sync::Semaphore;

/// Default pause before a flow with refused envelopes is woken to retry
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(250);

/// Scheduler occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Configured worker bound
    pub max_workers: usize,
    /// Permits currently free
    pub idle_workers: usize,
    /// Flows queued for or inside an activation
    pub running: usize,
    /// Flows parked on a wait
    pub parked: usize,
    /// Activations started since the scheduler was created
    pub activations: u64,
}

#[derive(Default)]
struct SchedulerState {
    parked: HashMap<RunId, FlowStateMachine>,
    // run id -> woken while running
    running: HashMap<RunId, bool>,
    activations: u64,
}

struct SchedulerInner {
    max_workers: usize,
    permits: Arc<Semaphore>,
    state: Mutex<SchedulerState>,
    tasks: Arc<TaskRegistry>,
    store: Arc<dyn CheckpointStore>,
    retention: Duration,
    redelivery: Duration,
}

/// Cooperative worker pool for flow activations
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler running at most `max_workers` activations at once
    pub fn new(
        max_workers: usize,
        tasks: Arc<TaskRegistry>,
        store: Arc<dyn CheckpointStore>,
        retention: Duration,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                max_workers,
                permits: Arc::new(Semaphore::new(max_workers)),
                state: Mutex::new(SchedulerState::default()),
                tasks,
                store,
                retention,
                redelivery: DEFAULT_REDELIVERY_DELAY,
            }),
        }
    }

    /// Use `delay` between hand-off attempts for refused envelopes
    ///
    /// Must be called before any flow is submitted.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.redelivery = delay;
        }
        self
    }

    /// Hand a started or recovered flow to the pool
    pub fn submit(&self, machine: FlowStateMachine) {
        let run_id = machine.run_id();
        {
            let mut state = self.inner.state.lock();
            if state.running.contains_key(&run_id) || state.parked.contains_key(&run_id) {
                tracing::error!(%run_id, "Flow submitted twice; dropping the second instance");
                return;
            }
            state.running.insert(run_id, false);
        }
        self.spawn(machine);
    }

    fn spawn(&self, machine: FlowStateMachine) {
        let inner = self.inner.clone();
        self.inner.tasks.spawn_cancellable(SchedulerInner::run(inner, machine));
    }

    /// Delete the checkpoint of a resolved flow once `delay` elapses
    pub fn expire_after(&self, run_id: RunId, delay: Duration) {
        self.inner.expire_after(run_id, delay);
    }

    /// Run ids currently parked
    pub fn parked_runs(&self) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self.inner.state.lock().parked.keys().copied().collect();
        runs.sort();
        runs
    }

    /// Current occupancy
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            max_workers: self.inner.max_workers,
            idle_workers: self.inner.permits.available_permits(),
            running: state.running.len(),
            parked: state.parked.len(),
            activations: state.activations,
        }
    }

    /// Stop accepting activations and drop every parked flow
    ///
    /// Dropped flows resolve their handles with
    /// [`FlowError::Abandoned`](strand_core::FlowError::Abandoned); their
    /// checkpoints stay in the store for the next start. Returns how many
    /// parked flows were released.
    pub fn close(&self) -> usize {
        self.inner.permits.close();
        let parked: Vec<FlowStateMachine> = self
            .inner
            .state
            .lock()
            .parked
            .drain()
            .map(|(_, machine)| machine)
            .collect();
        parked.len()
    }
}

impl FlowWaker for Scheduler {
    fn wake(&self, run_id: RunId) {
        let machine = {
            let mut state = self.inner.state.lock();
            if let Some(woken) = state.running.get_mut(&run_id) {
                *woken = true;
                tracing::trace!(%run_id, "Wake recorded for running flow");
                return;
            }
            let Some(machine) = state.parked.remove(&run_id) else {
                tracing::debug!(%run_id, "Ignoring wake for flow that is not hosted here");
                return;
            };
            state.running.insert(run_id, false);
            machine
        };
        tracing::debug!(%run_id, "Waking parked flow");
        self.spawn(machine);
    }
}

impl SchedulerInner {
    async fn run(inner: Arc<SchedulerInner>, mut machine: FlowStateMachine) {
        let run_id = machine.run_id();
        loop {
            let Ok(permit) = inner.permits.clone().acquire_owned().await else {
                tracing::debug!(%run_id, "Scheduler closed; activation dropped");
                inner.state.lock().running.remove(&run_id);
                return;
            };
            inner.state.lock().activations += 1;
            let activation = machine.activate().await;
            drop(permit);

            match activation {
                Ok(Activation::Parked) => {
                    let unsent = machine.has_unsent();
                    match inner.park(machine) {
                        Some(woken) => {
                            tracing::debug!(%run_id, "Woken during activation; polling again");
                            machine = woken;
                        }
                        None => {
                            if unsent {
                                SchedulerInner::redeliver_later(&inner, run_id);
                            }
                            return;
                        }
                    }
                }
                Ok(Activation::Resolved(state)) => {
                    inner.state.lock().running.remove(&run_id);
                    tracing::debug!(%run_id, %state, "Flow left the scheduler");
                    inner.expire_after(run_id, inner.retention);
                    return;
                }
                Err(e) => {
                    // Already logged by the machine; nothing left to run.
                    inner.state.lock().running.remove(&run_id);
                    tracing::debug!(%run_id, error = %e, "Activation refused");
                    return;
                }
            }
        }
    }

    /// Move a parked flow to the parking lot, or hand it back if a wake
    /// arrived while it was running
    fn park(&self, machine: FlowStateMachine) -> Option<FlowStateMachine> {
        let run_id = machine.run_id();
        let mut state = self.state.lock();
        if state.running.get(&run_id).copied().unwrap_or(false) {
            state.running.insert(run_id, false);
            return Some(machine);
        }
        state.running.remove(&run_id);
        if self.permits.is_closed() {
            tracing::debug!(%run_id, "Scheduler closed; releasing parked flow");
            return None;
        }
        tracing::trace!(%run_id, "Flow parked");
        state.parked.insert(run_id, machine);
        None
    }

    fn redeliver_later(inner: &Arc<SchedulerInner>, run_id: RunId) {
        tracing::debug!(%run_id, delay_ms = inner.redelivery.as_millis() as u64, "Hand-off retry scheduled");
        let scheduler = Scheduler {
            inner: inner.clone(),
        };
        inner.tasks.spawn_after(inner.redelivery, async move {
            scheduler.wake(run_id);
        });
    }

    fn expire_after(&self, run_id: RunId, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let store = self.store.clone();
        self.tasks.spawn_after(delay, async move {
            match store.delete(run_id).await {
                Ok(()) => tracing::debug!(%run_id, "Retention elapsed; checkpoint deleted"),
                Err(e) => tracing::warn!(%run_id, error = %e, "Failed to delete expired checkpoint"),
            }
        });
    }
}
