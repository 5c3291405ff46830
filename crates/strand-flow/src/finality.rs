//! Ledger finality signals
//!
//! The ledger pushes `notify_commit` to the node; the tracker remembers the
//! outcome and which parked flows wait for it. A flow registers before it
//! checks for an outcome, so a signal racing its suspension is never lost.
//!
//! Outcomes are remembered up to a fixed capacity, oldest first out. An
//! outcome whose woken flows have not yet consumed it is never evicted.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use strand_core::{CommitOutcome, RunId, TxHash};

/// Settled outcomes kept before the oldest unclaimed one is forgotten
pub const FINALITY_MEMORY: usize = 4096;

#[derive(Debug, Default)]
struct TrackerState {
    outcomes: HashMap<TxHash, CommitOutcome>,
    // insertion order of `outcomes`
    settled: VecDeque<TxHash>,
    waiters: HashMap<TxHash, BTreeSet<RunId>>,
    // flows notified of an outcome they have not polled yet
    woken: HashMap<TxHash, BTreeSet<RunId>>,
}

impl TrackerState {
    fn pinned(&self, hash: &TxHash) -> bool {
        self.waiters.contains_key(hash) || self.woken.contains_key(hash)
    }

    fn evict(&mut self, capacity: usize) {
        while self.outcomes.len() > capacity {
            let Some(index) = self.settled.iter().position(|hash| !self.pinned(hash)) else {
                break;
            };
            if let Some(hash) = self.settled.remove(index) {
                self.outcomes.remove(&hash);
                tracing::trace!(%hash, "Forgot settled outcome");
            }
        }
    }
}

fn release(runs: &mut HashMap<TxHash, BTreeSet<RunId>>, hash: &TxHash, run_id: RunId) {
    if let Some(set) = runs.get_mut(hash) {
        set.remove(&run_id);
        if set.is_empty() {
            runs.remove(hash);
        }
    }
}

/// Outcomes of transactions and the flows waiting on them
#[derive(Debug)]
pub struct FinalityTracker {
    state: Mutex<TrackerState>,
    capacity: usize,
}

impl Default for FinalityTracker {
    fn default() -> Self {
        Self::with_capacity(FINALITY_MEMORY)
    }
}

impl FinalityTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker remembering at most `capacity` unclaimed outcomes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            capacity,
        }
    }

    /// Record that `run_id` waits on `hash`
    pub fn register(&self, hash: TxHash, run_id: RunId) {
        self.state.lock().waiters.entry(hash).or_default().insert(run_id);
    }

    /// Known outcome of `hash`
    pub fn outcome(&self, hash: &TxHash) -> Option<CommitOutcome> {
        self.state.lock().outcomes.get(hash).cloned()
    }

    /// Number of outcomes currently remembered
    pub fn remembered(&self) -> usize {
        self.state.lock().outcomes.len()
    }

    /// Record an outcome and return the flows to wake
    ///
    /// The first outcome for a hash is authoritative; later signals are
    /// ignored.
    pub fn notify(&self, hash: TxHash, outcome: CommitOutcome) -> Vec<RunId> {
        let mut state = self.state.lock();
        if !state.outcomes.contains_key(&hash) {
            state.outcomes.insert(hash, outcome);
            state.settled.push_back(hash);
        }
        let runs = state.waiters.remove(&hash).unwrap_or_default();
        if !runs.is_empty() {
            state.woken.entry(hash).or_default().extend(runs.iter().copied());
        }
        state.evict(self.capacity);
        runs.into_iter().collect()
    }

    /// Stop tracking `run_id` for `hash`
    pub fn unregister(&self, hash: &TxHash, run_id: RunId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        release(&mut state.waiters, hash, run_id);
        release(&mut state.woken, hash, run_id);
        state.evict(self.capacity);
    }

    /// Stop tracking `run_id` for every hash
    pub fn forget_run(&self, run_id: RunId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for runs in [&mut state.waiters, &mut state.woken] {
            runs.retain(|_, set| {
                set.remove(&run_id);
                !set.is_empty()
            });
        }
        state.evict(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_wakes_registered_waiters_once() {
        let tracker = FinalityTracker::new();
        let hash = TxHash::of(b"tx");
        let run = RunId::new();
        tracker.register(hash, run);

        assert_eq!(tracker.notify(hash, CommitOutcome::Committed), vec![run]);
        assert!(tracker.notify(hash, CommitOutcome::Committed).is_empty());
        assert_eq!(tracker.outcome(&hash), Some(CommitOutcome::Committed));
    }

    #[test]
    fn first_outcome_wins() {
        let tracker = FinalityTracker::new();
        let hash = TxHash::of(b"tx");
        tracker.notify(
            hash,
            CommitOutcome::Rejected {
                reason: "conflict".into(),
            },
        );
        tracker.notify(hash, CommitOutcome::Committed);
        assert!(matches!(
            tracker.outcome(&hash),
            Some(CommitOutcome::Rejected { .. })
        ));
    }

    #[test]
    fn unregister_drops_waiter() {
        let tracker = FinalityTracker::new();
        let hash = TxHash::of(b"tx");
        let run = RunId::new();
        tracker.register(hash, run);
        tracker.unregister(&hash, run);
        assert!(tracker.notify(hash, CommitOutcome::Committed).is_empty());
    }

    #[test]
    fn unclaimed_outcomes_are_forgotten_past_capacity() {
        let tracker = FinalityTracker::with_capacity(2);
        let hashes: Vec<TxHash> = (0u8..3).map(|i| TxHash::of(&[i])).collect();
        for hash in &hashes {
            tracker.notify(*hash, CommitOutcome::Committed);
        }

        assert_eq!(tracker.remembered(), 2);
        assert_eq!(tracker.outcome(&hashes[0]), None);
        assert_eq!(tracker.outcome(&hashes[2]), Some(CommitOutcome::Committed));
    }

    #[test]
    fn woken_outcome_survives_until_its_flow_polls() {
        let tracker = FinalityTracker::with_capacity(1);
        let claimed = TxHash::of(b"claimed");
        let run = RunId::new();
        tracker.register(claimed, run);
        assert_eq!(tracker.notify(claimed, CommitOutcome::Committed), vec![run]);

        for i in 0u8..8 {
            tracker.notify(TxHash::of(&[i]), CommitOutcome::Committed);
        }
        assert_eq!(tracker.outcome(&claimed), Some(CommitOutcome::Committed));
        assert_eq!(tracker.remembered(), 2);

        tracker.unregister(&claimed, run);
        assert_eq!(tracker.outcome(&claimed), None);
        assert_eq!(tracker.remembered(), 1);
    }

    #[test]
    fn forget_run_releases_pinned_outcome() {
        let tracker = FinalityTracker::with_capacity(1);
        let claimed = TxHash::of(b"claimed");
        let run = RunId::new();
        tracker.register(claimed, run);
        tracker.notify(claimed, CommitOutcome::Committed);
        tracker.notify(TxHash::of(b"later"), CommitOutcome::Committed);
        assert_eq!(tracker.remembered(), 2);

        tracker.forget_run(run);
        assert_eq!(tracker.remembered(), 1);
        assert_eq!(tracker.outcome(&claimed), None);
    }
}
