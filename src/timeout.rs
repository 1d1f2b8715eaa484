//! Dial-timeout bookkeeping: a min-heap of (deadline, connection id).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Instant,
    id: u64,
}

/// Min-heap of dial deadlines. Entries are not removed when a dial
/// completes; the reactor skips entries whose connection is no longer
/// opening.
#[derive(Debug, Default)]
pub(crate) struct TimeoutQueue {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl TimeoutQueue {
    pub fn push(&mut self, deadline: Instant, id: u64) {
        self.heap.push(Reverse(Entry { deadline, id }));
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pops the next entry whose deadline has passed.
    pub fn pop_expired(&mut self, now: Instant) -> Option<u64> {
        match self.heap.peek() {
            Some(Reverse(e)) if e.deadline <= now => Some(self.heap.pop().unwrap().0.id),
            _ => None,
        }
    }
}
