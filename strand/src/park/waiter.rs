//! Wait entries and wake slots.
//!
//! A parking operation materializes one [`WaitEntry`] per key on the parking
//! context's own stack (pinned there for the whole park) and a single
//! heap-shared [`WakeSlot`] carrying the claim state and the wake target.
//! Bucket lists only ever reference entries while `queued` is set, and the
//! parked context retires every entry under the owning bucket lock before
//! `park*` returns, so the stack residency is sound.

use core::marker::PhantomPinned;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Thread;

use cordyceps::{Linked, list};
use static_assertions::assert_impl_all;

use crate::task::TaskRef;
use crate::time::Instant;

/// Claim states of a [`WakeSlot`]. Exactly one claimer wins the transition
/// out of `WAITING`; everyone else treats the waiter as gone.
pub(crate) const WAITING: u8 = 0;
/// An unparker won the claim and is still writing the token/index pair.
pub(crate) const CLAIMING: u8 = 1;
/// Claim complete: token and index are valid.
pub(crate) const UNPARKED: u8 = 2;
/// The deadline elapsed before any wake.
pub(crate) const TIMED_OUT: u8 = 3;

/// Where a claimed waiter resumes.
#[derive(Clone, Debug)]
pub(crate) enum WakeTarget {
    /// An OS thread blocked in [`WakeSlot::block`].
    Thread(Thread),
    /// A suspended task; waking re-enqueues it on its pool.
    Task(TaskRef),
}

/// Per-park-operation claim state.
#[derive(Debug)]
pub(crate) struct WakeSlot {
    state: AtomicU8,
    /// Unpark token, written by the winning claimer during `CLAIMING`.
    token: AtomicUsize,
    /// Index of the wait entry that got claimed, for multi-key parks.
    which: AtomicUsize,
    target: WakeTarget,
}

assert_impl_all!(WakeSlot: Send, Sync);

impl WakeSlot {
    pub(crate) fn new(target: WakeTarget) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WAITING),
            token: AtomicUsize::new(0),
            which: AtomicUsize::new(0),
            target,
        })
    }

    /// Claims the waiter for a wake, recording the entry index.
    ///
    /// The token is supplied later through [`finish_claim`], once the wake
    /// operation's callback has produced it; until then the slot reads as
    /// `CLAIMING` and owners must not consume it.
    ///
    /// [`finish_claim`]: WakeSlot::finish_claim
    pub(crate) fn begin_claim(&self, index: usize) -> bool {
        if self
            .state
            .compare_exchange(WAITING, CLAIMING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.which.store(index, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Completes a claim started with [`begin_claim`](WakeSlot::begin_claim).
    pub(crate) fn finish_claim(&self, token: usize) {
        self.token.store(token, Ordering::Relaxed);
        let prev = self.state.swap(UNPARKED, Ordering::Release);
        debug_assert_eq!(prev, CLAIMING);
    }

    /// Claims the waiter for a timeout. No token is delivered.
    pub(crate) fn claim_timeout(&self) -> bool {
        self.state
            .compare_exchange(WAITING, TIMED_OUT, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Resumes the claimed context. Must be called exactly once, after the
    /// claim has completed.
    pub(crate) fn wake(&self) {
        match &self.target {
            WakeTarget::Thread(thread) => thread.unpark(),
            WakeTarget::Task(task) => task.wake(),
        }
    }

    pub(crate) fn target(&self) -> &WakeTarget {
        &self.target
    }

    /// The outcome of a completed park: `Ok((index, token))` for a wake,
    /// `Err(())` for a timeout.
    ///
    /// Spins through the tiny `CLAIMING` window if the claimer is still
    /// writing.
    pub(crate) fn outcome(&self) -> Result<(usize, usize), ()> {
        loop {
            match self.state.load(Ordering::Acquire) {
                UNPARKED => {
                    return Ok((
                        self.which.load(Ordering::Relaxed),
                        self.token.load(Ordering::Relaxed),
                    ));
                }
                TIMED_OUT => return Err(()),
                CLAIMING => core::hint::spin_loop(),
                state => unreachable!("park resumed with unclaimed slot (state {state})"),
            }
        }
    }

    /// Blocks the current OS thread until the slot is claimed, claiming a
    /// timeout itself when `deadline` passes first.
    ///
    /// Only valid for `WakeTarget::Thread` slots owned by this thread.
    pub(crate) fn block(&self, deadline: Option<Instant>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                WAITING => {}
                CLAIMING | UNPARKED | TIMED_OUT => return,
                state => unreachable!("corrupt wake slot state {state}"),
            }

            match deadline {
                None => std::thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if self.claim_timeout() {
                            return;
                        }
                        // Lost the race to a wake; loop to observe it.
                        continue;
                    }
                    std::thread::park_timeout(deadline.saturating_duration_since(now));
                }
            }
        }
    }
}

/// One node in a bucket's wait list. Lives on the parking context's stack.
pub(crate) struct WaitEntry {
    /// Intrusive links, owned by whichever bucket currently queues the entry.
    links: list::Links<WaitEntry>,
    /// The key this entry is currently queued under. Requeue operations
    /// rewrite it while holding both affected bucket locks.
    key: AtomicUsize,
    /// Caller-supplied park token, read by wake filters.
    token: usize,
    /// Position of this entry within its park operation.
    index: usize,
    /// Whether the entry is linked into a bucket list. Written only under
    /// the lock of the bucket the entry currently belongs to.
    queued: AtomicBool,
    /// The park operation's shared claim state. The pointee outlives every
    /// bucket reference to this entry: the parking context holds the `Arc`
    /// until after all entries are retired.
    slot: NonNull<WakeSlot>,
    _pin: PhantomPinned,
}

// Safety: entries are shared between the parking context and unparkers that
// observe them through bucket lists; all mutable state is atomic or guarded
// by the bucket lock.
unsafe impl Send for WaitEntry {}
// Safety: see above.
unsafe impl Sync for WaitEntry {}

impl WaitEntry {
    pub(crate) fn new(key: usize, token: usize, index: usize, slot: &Arc<WakeSlot>) -> Self {
        Self {
            links: list::Links::new(),
            key: AtomicUsize::new(key),
            token,
            index,
            queued: AtomicBool::new(false),
            slot: NonNull::from(&**slot),
            _pin: PhantomPinned,
        }
    }

    pub(crate) fn key(&self) -> usize {
        self.key.load(Ordering::Relaxed)
    }

    /// Rebinds the entry to a new key. Caller must hold both the old and the
    /// new key's bucket locks.
    pub(crate) fn set_key(&self, key: usize) {
        self.key.store(key, Ordering::Relaxed);
    }

    pub(crate) fn token(&self) -> usize {
        self.token
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Relaxed)
    }

    /// Marks the entry linked/unlinked. Caller must hold the owning bucket
    /// lock.
    pub(crate) fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::Relaxed);
    }

    /// The park operation's claim state.
    ///
    /// # Safety
    ///
    /// Caller must either be the parking context itself or hold the lock of
    /// the bucket currently queueing the entry.
    pub(crate) unsafe fn slot(&self) -> &WakeSlot {
        // Safety: the parking context keeps the Arc alive until every entry
        // has been retired, and retirement takes the bucket lock.
        unsafe { self.slot.as_ref() }
    }
}

// Safety: `links` is the first point of contact for the list; entries are
// pinned for as long as they are queued and only ever owned by one bucket
// list at a time, with `NonNull` handles that never alias mutably.
unsafe impl Linked<list::Links<WaitEntry>> for WaitEntry {
    type Handle = NonNull<WaitEntry>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: target is a valid entry; projecting to a field keeps it in
        // bounds.
        unsafe { NonNull::new_unchecked(&raw mut (*target.as_ptr()).links) }
    }
}
