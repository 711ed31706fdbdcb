//! A condition variable paired with a [`Mutex`].
//!
//! The wait state is a 32-bit epoch counter: `wait` snapshots it under the
//! mutex, releases the mutex, and futex-waits while the counter is
//! unchanged; `signal`/`broadcast` bump the counter and wake. A signal that
//! lands between the release and the sleep changes the counter and the wait
//! returns immediately — no lost wakeups, but spurious ones are possible and
//! callers must re-check their predicate in a loop.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::WaitError;
use crate::futex::{self, Filter, Width};
use crate::sync::MutexGuard;
use crate::time::Instant;

pub struct Condition {
    epoch: AtomicU32,
    /// Identity of the mutex this condition is currently associated with.
    /// A condition may migrate to another mutex only once every prior
    /// waiter has woken.
    mutex_addr: AtomicUsize,
    /// Waiters between epoch snapshot and re-lock; maintained under the
    /// associated mutex.
    waiters: AtomicUsize,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub const fn new() -> Condition {
        Condition {
            epoch: AtomicU32::new(0),
            mutex_addr: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Releases the guard's mutex, waits for a signal, and re-acquires the
    /// mutex before returning.
    pub fn wait(&self, guard: &mut MutexGuard<'_>) {
        self.wait_inner(guard, None);
    }

    /// Like [`wait`](Condition::wait), but gives up at `deadline`. Returns
    /// true if the wait timed out.
    pub fn wait_until(&self, guard: &mut MutexGuard<'_>, deadline: Instant) -> bool {
        self.wait_inner(guard, Some(deadline))
    }

    fn wait_inner(&self, guard: &mut MutexGuard<'_>, deadline: Option<Instant>) -> bool {
        let mutex = guard.mutex();
        let addr = core::ptr::from_ref(mutex) as usize;

        // All of this runs under the mutex, so waiter accounting is simple.
        if self.waiters.load(Ordering::Relaxed) == 0 {
            self.mutex_addr.store(addr, Ordering::Relaxed);
        } else {
            debug_assert_eq!(
                self.mutex_addr.load(Ordering::Relaxed),
                addr,
                "condition migrated to a different mutex while waiters were queued"
            );
        }
        self.waiters.fetch_add(1, Ordering::Relaxed);

        let epoch = self.epoch.load(Ordering::Relaxed);
        mutex.unlock();

        // Safety: the epoch word is owned by this condition and outlives the
        // wait. An Invalid result means a signal already moved the epoch.
        let result = unsafe {
            futex::wait(
                core::ptr::from_ref(&self.epoch).cast(),
                Width::U32,
                u64::from(epoch),
                0,
                deadline,
            )
        };

        // Re-acquire before returning so the guard stays truthful.
        let relocked = mutex.lock();
        core::mem::forget(relocked);

        self.waiters.fetch_sub(1, Ordering::Relaxed);
        result == Err(WaitError::Timeout)
    }

    /// Wakes one waiter.
    pub fn signal(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
        // Safety: the epoch word is our own.
        let _ = unsafe { futex::wake(core::ptr::from_ref(&self.epoch).cast(), 1, Filter::ALL) };
    }

    /// Wakes every current waiter. Waiters arriving later are unaffected.
    pub fn broadcast(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
        // Safety: the epoch word is our own.
        let _ = unsafe {
            futex::wake(
                core::ptr::from_ref(&self.epoch).cast(),
                usize::MAX,
                Filter::ALL,
            )
        };
    }
}

impl core::fmt::Debug for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condition")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
