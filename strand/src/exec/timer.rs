//! Deadline tracking for parked tasks.
//!
//! A pool-wide min-heap of `(deadline, wake slot)` pairs. Parking with a
//! deadline registers here; idle workers *turn* the timer, claiming a
//! timeout on every expired slot and waking its task. Slots whose waiter was
//! already woken lose the claim CAS and are simply discarded, so stale
//! entries cost nothing but heap space until their deadline passes.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use spin::Mutex;

use crate::park::WakeSlot;
use crate::time::Instant;

pub(crate) struct Timer {
    heap: Mutex<BinaryHeap<Entry>>,
}

struct Entry {
    deadline: Instant,
    slot: Arc<WakeSlot>,
}

// BinaryHeap is a max-heap; order entries by *reversed* deadline so the
// earliest one surfaces first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Entry {}

impl Timer {
    pub(crate) fn new() -> Timer {
        Timer {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Registers a deadline. Returns true when it became the earliest one,
    /// in which case a sleeping worker should be nudged to shorten its nap.
    pub(crate) fn register(&self, deadline: Instant, slot: Arc<WakeSlot>) -> bool {
        let mut heap = self.heap.lock();
        let was_earliest = heap.peek().is_none_or(|e| deadline < e.deadline);
        heap.push(Entry { deadline, slot });
        was_earliest
    }

    /// Fires every deadline at or before `now`. Returns how many waiters
    /// were timed out and the next pending deadline, if any.
    pub(crate) fn turn(&self, now: Instant) -> (usize, Option<Instant>) {
        let mut expired = Vec::new();
        let next = {
            let mut heap = self.heap.lock();
            while let Some(entry) = heap.peek() {
                if entry.deadline > now {
                    break;
                }
                expired.push(heap.pop().expect("peeked entry vanished"));
            }
            heap.peek().map(|e| e.deadline)
        };

        let mut fired = 0;
        for entry in expired {
            // The claim decides between a real timeout and a wake that beat
            // the deadline; losers are stale and silently dropped.
            if entry.slot.claim_timeout() {
                entry.slot.wake();
                fired += 1;
            }
        }

        (fired, next)
    }
}
