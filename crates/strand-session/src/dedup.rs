//! Message sequencing and de-duplication
//!
//! The transport delivers at least once. Every outbound envelope on a
//! session carries the next value of a strictly increasing counter starting
//! at 1, and the receiving end accepts a sequence number only if it is
//! greater than the last one it accepted.

use serde::{Deserialize, Serialize};

/// Outbound sequence counter for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSequencer {
    next: u64,
}

impl OutboundSequencer {
    /// Counter for a fresh session
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Counter restored from a checkpoint
    pub fn resume_at(next: u64) -> Self {
        Self { next: next.max(1) }
    }

    /// Claim the next sequence number
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next;
        self.next += 1;
        sequence
    }

    /// Sequence number the next envelope will carry
    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for OutboundSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of offering an inbound sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New message; the high-water mark advanced
    Accepted,
    /// Retransmission of something already accepted
    Duplicate,
}

/// Inbound high-water mark for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboundDeduplicator {
    last_accepted: u64,
}

impl InboundDeduplicator {
    /// Deduplicator for a fresh session
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduplicator that has already accepted everything up to `sequence`
    pub fn starting_after(sequence: u64) -> Self {
        Self {
            last_accepted: sequence,
        }
    }

    /// Offer an inbound sequence number
    pub fn admit(&mut self, sequence: u64) -> Admission {
        if sequence <= self.last_accepted {
            Admission::Duplicate
        } else {
            self.last_accepted = sequence;
            Admission::Accepted
        }
    }

    /// Highest sequence accepted so far
    pub fn last_accepted(&self) -> u64 {
        self.last_accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_starts_at_one() {
        let mut sequencer = OutboundSequencer::new();
        assert_eq!(sequencer.next_sequence(), 1);
        assert_eq!(sequencer.next_sequence(), 2);
        assert_eq!(sequencer.peek(), 3);
        assert_eq!(OutboundSequencer::resume_at(0).peek(), 1);
    }

    #[test]
    fn redelivery_is_collapsed() {
        let mut dedup = InboundDeduplicator::new();
        assert_eq!(dedup.admit(1), Admission::Accepted);
        assert_eq!(dedup.admit(1), Admission::Duplicate);
        assert_eq!(dedup.admit(2), Admission::Accepted);
        assert_eq!(dedup.admit(1), Admission::Duplicate);
        assert_eq!(dedup.last_accepted(), 2);
    }

    #[test]
    fn restored_deduplicator_reaccepts_unconsumed() {
        // Accepted 1..=3 but only consumed 1 before the crash.
        let mut dedup = InboundDeduplicator::starting_after(1);
        assert_eq!(dedup.admit(1), Admission::Duplicate);
        assert_eq!(dedup.admit(2), Admission::Accepted);
        assert_eq!(dedup.admit(3), Admission::Accepted);
    }
}

#[cfg(test)]
mod proptest_sequencing {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Accepted sequence numbers are strictly increasing whatever the
        /// delivery order and duplication
        #[test]
        fn accepted_strictly_increasing(deliveries in prop::collection::vec(1u64..50, 0..200)) {
            let mut dedup = InboundDeduplicator::new();
            let mut last = 0u64;
            for sequence in deliveries {
                if dedup.admit(sequence) == Admission::Accepted {
                    prop_assert!(sequence > last);
                    last = sequence;
                }
                prop_assert_eq!(dedup.last_accepted(), last);
            }
        }

        /// In-order delivery with arbitrary retransmissions accepts each
        /// message exactly once
        #[test]
        fn in_order_with_duplicates_accepts_each_once(repeats in prop::collection::vec(1usize..4, 1..60)) {
            let mut sender = OutboundSequencer::new();
            let mut dedup = InboundDeduplicator::new();
            let mut accepted = Vec::new();
            for copies in &repeats {
                let sequence = sender.next_sequence();
                for _ in 0..*copies {
                    if dedup.admit(sequence) == Admission::Accepted {
                        accepted.push(sequence);
                    }
                }
            }
            let expected: Vec<u64> = (1..=repeats.len() as u64).collect();
            prop_assert_eq!(accepted, expected);
        }
    }
}
