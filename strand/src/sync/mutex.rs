//! A byte-sized mutual exclusion lock.
//!
//! The state byte has three values: unlocked, locked, and locked-with-
//! waiters. Uncontended lock/unlock are a single CAS each and never touch
//! the parking lot. The contended path parks on the state byte's address;
//! unlockers wake one waiter, and when the parking lot's fairness timer
//! fires they hand the lock over directly, without an unlocked window in
//! between.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::futex::{self, Width};
use crate::park::{self, UnparkResult};

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
/// Locked with (possible) waiters; unlocking must go through the slow path.
const CONTENDED: u8 = 2;

/// Unpark token: the lock was released, retry acquiring it.
const TOKEN_RETRY: usize = 0;
/// Unpark token: the unlocker handed the lock directly to the woken waiter.
const TOKEN_HANDOFF: usize = 1;

/// Bounded spin before parking; contended locks are usually held briefly.
const SPIN_LIMIT: u32 = 64;

pub struct Mutex {
    state: AtomicU8,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            state: AtomicU8::new(UNLOCKED),
        }
    }

    /// Acquires the lock without blocking, if it is free.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(MutexGuard {
                mutex: self,
                _not_send: PhantomData,
            })
    }

    /// Acquires the lock, suspending the calling context while it is held
    /// elsewhere.
    pub fn lock(&self) -> MutexGuard<'_> {
        if self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    #[cold]
    fn lock_slow(&self) {
        // Short adaptive spin: retry while the lock looks briefly held and
        // nobody is parked yet.
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            match self.state.load(Ordering::Relaxed) {
                UNLOCKED => {
                    if self
                        .state
                        .compare_exchange_weak(
                            UNLOCKED,
                            LOCKED,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                LOCKED => core::hint::spin_loop(),
                _ => break,
            }
            spins += 1;
        }

        loop {
            // Announce a waiter. If the lock happened to be free, the swap
            // both acquired it and (pessimistically) marked it contended.
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }

            // Safety: the state byte is owned by this mutex and outlives the
            // wait.
            let result = unsafe {
                futex::wait(
                    core::ptr::from_ref(&self.state).cast(),
                    Width::U8,
                    u64::from(CONTENDED),
                    0,
                    None,
                )
            };
            if result == Ok(TOKEN_HANDOFF) {
                // The unlocker transferred ownership without unlocking.
                return;
            }
            // Retry; the state may have changed under us (Invalid) or we
            // must race for the lock again (plain wake).
        }
    }

    pub(crate) fn unlock(&self) {
        if self
            .state
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.unlock_slow();
    }

    #[cold]
    fn unlock_slow(&self) {
        park::unpark_one(core::ptr::from_ref(&self.state) as usize, |result: UnparkResult| {
            if result.unparked == 1 && result.be_fair {
                // Fair hand-off: ownership moves to the woken waiter while
                // the lock never reads unlocked.
                let next = if result.has_more { CONTENDED } else { LOCKED };
                self.state.store(next, Ordering::Release);
                TOKEN_HANDOFF
            } else {
                // Plain release. A woken waiter re-announces itself with a
                // swap to contended, so remaining sleepers are never lost.
                self.state.store(UNLOCKED, Ordering::Release);
                TOKEN_RETRY
            }
        });
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Proof of ownership of a [`Mutex`]; unlocks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
    /// Guards stay on the acquiring context.
    _not_send: PhantomData<*mut ()>,
}

impl MutexGuard<'_> {
    pub(crate) fn mutex(&self) -> &Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn try_lock_reflects_ownership() {
        let mutex = Mutex::new();
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn uncontended_lock_never_marks_contended() {
        let mutex = Mutex::new();
        for _ in 0..100 {
            let guard = mutex.lock();
            assert_eq!(mutex.state.load(Ordering::Relaxed), LOCKED);
            drop(guard);
            assert_eq!(mutex.state.load(Ordering::Relaxed), UNLOCKED);
        }
    }

    #[test]
    fn counter_under_contention() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let mutex = Arc::new(Mutex::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = mutex.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        let _guard = mutex.lock();
                        // Non-atomic read-modify-write under the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), THREADS * PER_THREAD);
    }
}
