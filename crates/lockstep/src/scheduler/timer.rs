//! Min-ordered timer queue for timed waits.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::coro::CoroId;

/// Entry in the timer heap.
struct TimerEntry {
    deadline: Instant,
    coro: CoroId,
    /// Epoch of the owning record when the entry was queued. A record bumps
    /// its epoch to tombstone stale entries.
    epoch: u64,
    /// Insertion sequence; ties on equal deadlines pop in insertion order.
    seq: u64,
}

// Reverse ordering for a min-heap (earliest deadline first).
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Timer queue: min-ordered by deadline, with tombstoned entries skipped on
/// pop.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Queue a wakeup for `coro` at `deadline`.
    pub fn insert(&mut self, deadline: Instant, coro: CoroId, epoch: u64) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            coro,
            epoch,
            seq,
        });
    }

    /// Drop every entry queued for `coro`.
    pub fn remove(&mut self, coro: CoroId) {
        self.heap.retain(|entry| entry.coro != coro);
    }

    /// Pop every entry due at `now`. Callers must still check the returned
    /// epoch against the record, in case the wait was re-armed.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(CoroId, u64)> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked timer entry");
            due.push((entry.coro, entry.epoch));
        }
        due
    }

    /// Deadline of the nearest pending entry.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coro_id() -> CoroId {
        crate::coro::Coro::ready(crate::value::Value::absent()).id()
    }

    #[test]
    fn test_pop_due_orders_by_deadline() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let (a, b, c) = (coro_id(), coro_id(), coro_id());
        timers.insert(now + Duration::from_millis(30), c, 0);
        timers.insert(now + Duration::from_millis(10), a, 0);
        timers.insert(now + Duration::from_millis(20), b, 0);

        let due = timers.pop_due(now + Duration::from_millis(25));
        assert_eq!(due, vec![(a, 0), (b, 0)]);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(30)));
    }

    #[test]
    fn test_equal_deadlines_pop_in_insertion_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let (a, b, c) = (coro_id(), coro_id(), coro_id());
        timers.insert(now, a, 0);
        timers.insert(now, b, 1);
        timers.insert(now, c, 2);

        let due = timers.pop_due(now);
        assert_eq!(due, vec![(a, 0), (b, 1), (c, 2)]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_remove_drops_all_entries_for_a_coro() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let (a, b) = (coro_id(), coro_id());
        timers.insert(now, a, 0);
        timers.insert(now + Duration::from_millis(5), a, 1);
        timers.insert(now, b, 0);

        timers.remove(a);
        let due = timers.pop_due(now + Duration::from_millis(10));
        assert_eq!(due, vec![(b, 0)]);
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.insert(now + Duration::from_secs(60), coro_id(), 0);
        assert!(timers.pop_due(now).is_empty());
        assert!(!timers.is_empty());
    }
}
