//! Idle-worker tracking.
//!
//! One slot per worker: a sleeping flag plus the worker's thread handle.
//! Work producers flip a sleeper's flag and unpark it; the flag handshake
//! (set *before* the final work re-check on the sleep side, consumed by the
//! waker) makes lost wakeups impossible. Pinned work can target its specific
//! worker; everything else wakes an arbitrary sleeper.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread::Thread;

use crate::exec::WorkerId;
use crate::time::Instant;

pub(crate) struct IdleSet {
    slots: Vec<Slot>,
    num_idle: AtomicUsize,
}

struct Slot {
    thread: OnceLock<Thread>,
    sleeping: AtomicBool,
}

impl IdleSet {
    pub(crate) fn new(workers: usize) -> IdleSet {
        IdleSet {
            slots: (0..workers)
                .map(|_| Slot {
                    thread: OnceLock::new(),
                    sleeping: AtomicBool::new(false),
                })
                .collect(),
            num_idle: AtomicUsize::new(0),
        }
    }

    /// Binds a worker's OS thread to its slot. Called once per worker at
    /// startup.
    pub(crate) fn register(&self, worker: WorkerId, thread: Thread) {
        self.slots[worker.index()]
            .thread
            .set(thread)
            .expect("worker registered twice");
    }

    pub(crate) fn num_idle(&self) -> usize {
        self.num_idle.load(Ordering::Acquire)
    }

    /// Puts the calling worker to sleep until notified, `until` passes, or
    /// `has_work` turns true.
    ///
    /// `has_work` is evaluated *after* the sleeping flag is published, which
    /// closes the race against producers that push work and then look for a
    /// sleeper to wake.
    pub(crate) fn park(&self, worker: WorkerId, until: Option<Instant>, has_work: impl Fn() -> bool) {
        let slot = &self.slots[worker.index()];

        slot.sleeping.store(true, Ordering::SeqCst);
        self.num_idle.fetch_add(1, Ordering::Release);

        if !has_work() {
            match until {
                None => std::thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if let Some(wait) = deadline.checked_duration_since(now) {
                        std::thread::park_timeout(wait);
                    }
                }
            }
        }

        slot.sleeping.store(false, Ordering::SeqCst);
        self.num_idle.fetch_sub(1, Ordering::Release);
    }

    /// Wakes an arbitrary sleeping worker, if any.
    pub(crate) fn notify_one(&self) {
        for slot in &self.slots {
            if slot.sleeping.swap(false, Ordering::SeqCst) {
                if let Some(thread) = slot.thread.get() {
                    thread.unpark();
                }
                return;
            }
        }
    }

    /// Wakes a specific worker if it is sleeping; pinned work only it can
    /// run may have landed in its queue.
    pub(crate) fn notify_worker(&self, worker: WorkerId) {
        let slot = &self.slots[worker.index()];
        if slot.sleeping.swap(false, Ordering::SeqCst) {
            if let Some(thread) = slot.thread.get() {
                thread.unpark();
            }
        }
    }

    /// Wakes every sleeping worker (shutdown, drained).
    pub(crate) fn notify_all(&self) {
        for slot in &self.slots {
            if slot.sleeping.swap(false, Ordering::SeqCst) {
                if let Some(thread) = slot.thread.get() {
                    thread.unpark();
                }
            }
        }
    }
}
