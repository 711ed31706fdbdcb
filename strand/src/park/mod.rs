//! The parking lot: a process-wide keyed wait-queue table.
//!
//! Any address can serve as a wait key. Keys hash to one of a fixed, prime
//! number of buckets; each bucket owns a short spin lock and an intrusive
//! doubly linked list of waiters. Waiter nodes live on the parking context's
//! stack (which is pinned — a parked task's coroutine cannot move, and a
//! parked thread is blocked), so queueing allocates nothing per key.
//!
//! Both kinds of execution context park here: a task suspends its coroutine
//! and is re-enqueued on its pool when woken, a foreign thread blocks on its
//! own wake slot. This is what lets the runtime's mutex and condition work
//! from submitter threads as well as from tasks.
//!
//! Wake-side operations locate the bucket, select waiters (optionally through
//! a token filter), claim each selected waiter with a CAS, produce the unpark
//! token via a caller callback *under the bucket lock*, and deliver wakes
//! after the lock drops. Claim losers treat the waiter as already gone and
//! unlink its entry cooperatively.

mod waiter;

use core::ptr::NonNull;
use std::sync::Arc;

use arrayvec::ArrayVec;
use cordyceps::List;
use spin::{Mutex, MutexGuard};

use crate::task;
use crate::time::Instant;

pub(crate) use waiter::{WaitEntry, WakeSlot, WakeTarget};

/// Maximum number of keys a single [`park_multiple`] may wait on.
pub const MAX_PARK_KEYS: usize = 128;

/// Outcome of [`park`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParkResult {
    /// A wake operation selected this waiter and delivered the contained
    /// unpark token.
    Unparked(usize),
    /// The validation callback failed; the caller never slept.
    Invalid,
    /// The deadline elapsed with no wake observed.
    TimedOut,
}

/// Outcome of [`park_multiple`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MultiParkResult {
    /// A wake on the key at `index` delivered `token`.
    Unparked { index: usize, token: usize },
    /// A validation callback failed; nothing was inserted.
    Invalid,
    /// The deadline elapsed with no wake observed.
    TimedOut,
    /// The key slice was empty or longer than [`MAX_PARK_KEYS`].
    KeyError,
}

/// Statistics handed to wake-operation callbacks and returned to callers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UnparkResult {
    /// Number of waiters woken by this operation.
    pub unparked: usize,
    /// Number of waiters moved to the target key by a requeue.
    pub requeued: usize,
    /// Whether waiters remain on the source key afterwards.
    pub has_more: bool,
    /// Whether the bucket's fairness timer elapsed; callers typically respond
    /// with a direct hand-off.
    pub be_fair: bool,
}

/// Per-waiter verdict of a wake filter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterOp {
    /// Wake this waiter.
    Unpark,
    /// Leave this waiter queued and keep iterating.
    Skip,
    /// Leave this waiter queued and stop iterating.
    Stop,
}

const BUCKET_COUNT: usize = 251;

struct Bucket {
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    queue: List<WaitEntry>,
    fair: FairTimer,
}

/// Pseudo-random fair-wake sampling, averaging one fair wake per key per
/// ~0.5 ms. Seeded per bucket from its address and a process-start value so
/// unrelated processes don't run in lockstep.
struct FairTimer {
    deadline_nanos: u64,
    rng: Option<fastrand::Rng>,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(BucketInner {
                queue: List::new(),
                fair: FairTimer {
                    deadline_nanos: 0,
                    rng: None,
                },
            }),
        }
    }
}

impl BucketInner {
    fn has_waiter_for(&self, key: usize) -> bool {
        self.queue.iter().any(|e| e.key() == key)
    }
}

impl FairTimer {
    fn be_fair(&mut self, seed: u64, now: Instant) -> bool {
        if now.as_nanos() < self.deadline_nanos {
            return false;
        }
        let rng = self
            .rng
            .get_or_insert_with(|| fastrand::Rng::with_seed(seed ^ crate::time::anchor_entropy()));
        self.deadline_nanos = now.as_nanos().saturating_add(rng.u64(0..1_000_000));
        true
    }
}

static BUCKETS: [Bucket; BUCKET_COUNT] = [const { Bucket::new() }; BUCKET_COUNT];

fn bucket_index(key: usize) -> usize {
    // Fibonacci hash spreads nearby addresses before the prime modulus.
    (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 16) % BUCKET_COUNT
}

fn lock_bucket(key: usize) -> MutexGuard<'static, BucketInner> {
    BUCKETS[bucket_index(key)].inner.lock()
}

fn bucket_seed(key: usize) -> u64 {
    core::ptr::from_ref(&BUCKETS[bucket_index(key)]) as u64
}

/// Parks the current context on `key`.
///
/// `validate` runs under the bucket lock; returning false aborts with
/// [`ParkResult::Invalid`] before anything is queued. `before_sleep` runs
/// after the bucket lock is released but before the context suspends; it may
/// take other parking-lot locks but must not park. On a timeout, `timed_out`
/// is invoked under the bucket lock with the waiter's final key (which may
/// differ from `key` after a requeue) and whether it was the last waiter on
/// that key.
///
/// The callbacks must not panic.
pub fn park(
    key: usize,
    validate: impl FnOnce() -> bool,
    before_sleep: impl FnOnce(),
    timed_out: impl FnOnce(usize, bool),
    park_token: usize,
    deadline: Option<Instant>,
) -> ParkResult {
    let slot = WakeSlot::new(current_target());
    let entry = WaitEntry::new(key, park_token, 0, &slot);

    {
        let mut bucket = lock_bucket(key);
        if !validate() {
            return ParkResult::Invalid;
        }
        bucket.queue.push_back(NonNull::from(&entry));
        entry.set_queued(true);
    }

    before_sleep();
    wait_for_claim(&slot, deadline);

    let outcome = slot.outcome();
    retire_entry(&entry, outcome.is_err(), timed_out);

    match outcome {
        Ok((_, token)) => ParkResult::Unparked(token),
        Err(()) => ParkResult::TimedOut,
    }
}

/// Parks the current context on every key in `keys` at once.
///
/// All insertions happen atomically: every affected bucket is locked (in
/// table order), every `validate(i)` runs, and only if all of them pass is
/// the waiter queued anywhere. A single wake on any of the keys retires the
/// waiter from all of them. The same key may appear more than once; each
/// occurrence waits independently and one wake consumes them all.
pub fn park_multiple(
    keys: &[usize],
    mut validate: impl FnMut(usize) -> bool,
    before_sleep: impl FnOnce(),
    park_token: usize,
    deadline: Option<Instant>,
) -> MultiParkResult {
    if keys.is_empty() || keys.len() > MAX_PARK_KEYS {
        return MultiParkResult::KeyError;
    }

    let slot = WakeSlot::new(current_target());

    // Entries must not move once linked; the Vec is sized up front and never
    // grown afterwards.
    let entries: Vec<WaitEntry> = keys
        .iter()
        .enumerate()
        .map(|(i, &key)| WaitEntry::new(key, park_token, i, &slot))
        .collect();

    {
        // Lock every affected bucket in table order (deduplicated), then
        // validate and insert while all of them are held.
        let mut indices: ArrayVec<usize, MAX_PARK_KEYS> =
            keys.iter().map(|&k| bucket_index(k)).collect();
        indices.sort_unstable();
        let mut write = 1;
        for read in 1..indices.len() {
            if indices[read] != indices[write - 1] {
                indices[write] = indices[read];
                write += 1;
            }
        }
        indices.truncate(write);

        let mut guards: ArrayVec<MutexGuard<'static, BucketInner>, MAX_PARK_KEYS> = indices
            .iter()
            .map(|&i| BUCKETS[i].inner.lock())
            .collect();

        for i in 0..keys.len() {
            if !validate(i) {
                return MultiParkResult::Invalid;
            }
        }

        for entry in &entries {
            let slot_idx = indices
                .iter()
                .position(|&i| i == bucket_index(entry.key()))
                .expect("bucket index missing from lock set");
            guards[slot_idx].queue.push_back(NonNull::from(entry));
            entry.set_queued(true);
        }
    }

    before_sleep();
    wait_for_claim(&slot, deadline);

    let outcome = slot.outcome();
    for entry in &entries {
        retire_entry(entry, false, |_, _| {});
    }

    match outcome {
        Ok((index, token)) => MultiParkResult::Unparked { index, token },
        Err(()) => MultiParkResult::TimedOut,
    }
}

/// Wakes at most one waiter from `key`.
///
/// `callback` runs exactly once under the bucket lock, sees the result of
/// the operation, and produces the unpark token delivered to the woken
/// waiter (if any). It must not panic and must not touch the parking lot.
pub fn unpark_one(key: usize, callback: impl FnOnce(UnparkResult) -> usize) -> UnparkResult {
    let mut result = UnparkResult::default();
    let wake;

    {
        let mut bucket = lock_bucket(key);

        let claimed = claim_first(&mut bucket, key);

        if claimed.is_some() {
            result.unparked = 1;
            result.has_more = bucket.has_waiter_for(key);
            result.be_fair = bucket.fair.be_fair(bucket_seed(key), Instant::now());
        }

        let token = callback(result);

        wake = claimed.map(|entry_ptr| {
            // Safety: we hold the bucket lock and just unlinked the entry;
            // its slot stays alive at least until the claim completes.
            let slot = unsafe { entry_ptr.as_ref().slot() };
            slot.finish_claim(token);
            slot.target().clone()
        });
    }

    if let Some(target) = wake {
        target.deliver();
    }
    result
}

/// Wakes every waiter on `key`, delivering `token` to each. Returns the
/// number of waiters woken.
pub fn unpark_all(key: usize, token: usize) -> usize {
    let mut wakes = Vec::new();

    {
        let mut bucket = lock_bucket(key);

        let matches: Vec<NonNull<WaitEntry>> = bucket
            .queue
            .iter()
            .filter(|e| e.key() == key)
            .map(NonNull::from)
            .collect();

        for ptr in matches {
            // Safety: collected under the lock we still hold; removal of one
            // entry does not invalidate the other collected nodes.
            unsafe {
                let entry = ptr.as_ref();
                bucket.queue.remove(ptr);
                entry.set_queued(false);
                if entry.slot().begin_claim(entry.index()) {
                    entry.slot().finish_claim(token);
                    wakes.push(entry.slot().target().clone());
                }
            }
        }
    }

    let count = wakes.len();
    for target in wakes {
        target.deliver();
    }
    count
}

/// Wakes waiters on `key` selected by `filter`, which sees each waiter's
/// park token in queue order and yields [`FilterOp`]. `callback` runs once
/// at the end, under the lock, producing the token delivered to every woken
/// waiter.
pub fn unpark_filter(
    key: usize,
    mut filter: impl FnMut(usize) -> FilterOp,
    callback: impl FnOnce(UnparkResult) -> usize,
) -> UnparkResult {
    let mut result = UnparkResult::default();
    let mut wakes = Vec::new();

    {
        let mut bucket = lock_bucket(key);

        let mut selected: Vec<NonNull<WaitEntry>> = Vec::new();
        let mut stale: Vec<NonNull<WaitEntry>> = Vec::new();

        for entry in bucket.queue.iter() {
            if entry.key() != key {
                continue;
            }
            match filter(entry.token()) {
                // Safety: iterating under the bucket lock.
                FilterOp::Unpark => unsafe {
                    if entry.slot().begin_claim(entry.index()) {
                        selected.push(NonNull::from(entry));
                    } else {
                        stale.push(NonNull::from(entry));
                    }
                },
                FilterOp::Skip => {}
                FilterOp::Stop => break,
            }
        }

        for ptr in stale {
            // Safety: still under the bucket lock; see unpark_all.
            unsafe {
                bucket.queue.remove(ptr);
                ptr.as_ref().set_queued(false);
            }
        }
        for &ptr in &selected {
            // Safety: still under the bucket lock; see unpark_all.
            unsafe {
                bucket.queue.remove(ptr);
                ptr.as_ref().set_queued(false);
            }
        }

        result.unparked = selected.len();
        result.has_more = bucket.has_waiter_for(key);
        if result.unparked > 0 {
            result.be_fair = bucket.fair.be_fair(bucket_seed(key), Instant::now());
        }

        let token = callback(result);

        for ptr in selected {
            // Safety: claim is ours; the slot outlives it.
            let slot = unsafe { ptr.as_ref().slot() };
            slot.finish_claim(token);
            wakes.push(slot.target().clone());
        }
    }

    for target in wakes {
        target.deliver();
    }
    result
}

/// Wakes up to `max_wakes` waiters from `key_from` (subject to `filter`) and
/// moves up to `max_requeues` further waiters onto `key_to`'s queue.
///
/// Both bucket locks are taken in table order, so any pair of keys is
/// deadlock-free. `validate` runs with both locks held; returning `None`
/// aborts the operation with an all-zero result. `callback` sees the final
/// counts and produces the token for the woken waiters.
pub fn unpark_requeue(
    key_from: usize,
    key_to: usize,
    validate: impl FnOnce() -> Option<(usize, usize)>,
    mut filter: impl FnMut(usize) -> FilterOp,
    callback: impl FnOnce(UnparkResult) -> usize,
) -> UnparkResult {
    let mut result = UnparkResult::default();
    let mut wakes = Vec::new();

    {
        let from_idx = bucket_index(key_from);
        let to_idx = bucket_index(key_to);

        // Lock order: ascending table index; a shared bucket is locked once.
        let (mut from_guard, mut to_guard) = if from_idx == to_idx {
            (BUCKETS[from_idx].inner.lock(), None)
        } else if from_idx < to_idx {
            let from = BUCKETS[from_idx].inner.lock();
            let to = BUCKETS[to_idx].inner.lock();
            (from, Some(to))
        } else {
            let to = BUCKETS[to_idx].inner.lock();
            let from = BUCKETS[from_idx].inner.lock();
            (from, Some(to))
        };

        let Some((max_wakes, max_requeues)) = validate() else {
            return result;
        };

        let mut claimed: Vec<NonNull<WaitEntry>> = Vec::new();
        let mut stale: Vec<NonNull<WaitEntry>> = Vec::new();
        let mut moved: Vec<NonNull<WaitEntry>> = Vec::new();
        let mut stopped = false;

        for entry in from_guard.queue.iter() {
            if entry.key() != key_from {
                continue;
            }
            if claimed.len() < max_wakes && !stopped {
                match filter(entry.token()) {
                    // Safety: iterating under the bucket lock.
                    FilterOp::Unpark => unsafe {
                        if entry.slot().begin_claim(entry.index()) {
                            claimed.push(NonNull::from(entry));
                        } else {
                            stale.push(NonNull::from(entry));
                        }
                        continue;
                    },
                    FilterOp::Skip => continue,
                    FilterOp::Stop => {
                        stopped = true;
                        continue;
                    }
                }
            }
            if moved.len() < max_requeues {
                moved.push(NonNull::from(entry));
            } else {
                break;
            }
        }

        for ptr in stale {
            // Safety: under the from-bucket lock; see unpark_all.
            unsafe {
                from_guard.queue.remove(ptr);
                ptr.as_ref().set_queued(false);
            }
        }
        for &ptr in &claimed {
            // Safety: under the from-bucket lock; see unpark_all.
            unsafe {
                from_guard.queue.remove(ptr);
                ptr.as_ref().set_queued(false);
            }
        }
        for &ptr in &moved {
            // Safety: both bucket locks are held, which is what set_key and
            // the list transfer require.
            unsafe {
                from_guard.queue.remove(ptr);
                ptr.as_ref().set_key(key_to);
                match to_guard.as_mut() {
                    Some(to) => to.queue.push_back(ptr),
                    None => from_guard.queue.push_back(ptr),
                }
            }
        }

        result.unparked = claimed.len();
        result.requeued = moved.len();
        result.has_more = from_guard.has_waiter_for(key_from);
        if result.unparked > 0 {
            result.be_fair = from_guard.fair.be_fair(bucket_seed(key_from), Instant::now());
        }

        let token = callback(result);

        for ptr in claimed {
            // Safety: claim is ours; the slot outlives it.
            let slot = unsafe { ptr.as_ref().slot() };
            slot.finish_claim(token);
            wakes.push(slot.target().clone());
        }
    }

    for target in wakes {
        target.deliver();
    }
    result
}

/// Finds, claims and unlinks the first live waiter for `key`, unlinking any
/// stale (claimed-elsewhere) entries encountered on the way.
fn claim_first(bucket: &mut BucketInner, key: usize) -> Option<NonNull<WaitEntry>> {
    loop {
        let mut found: Option<(NonNull<WaitEntry>, bool)> = None;

        for entry in bucket.queue.iter() {
            if entry.key() == key {
                // Safety: iterating under the bucket lock.
                let live = unsafe { entry.slot().begin_claim(entry.index()) };
                found = Some((NonNull::from(entry), live));
                break;
            }
        }

        match found {
            None => return None,
            Some((ptr, live)) => {
                // Safety: under the bucket lock; the entry is queued here.
                unsafe {
                    bucket.queue.remove(ptr);
                    ptr.as_ref().set_queued(false);
                }
                if live {
                    return Some(ptr);
                }
                // Stale entry of a waiter claimed through another key; keep
                // scanning.
            }
        }
    }
}

/// Unlinks `entry` from whatever bucket currently queues it, if any. With
/// `timed_out_flag` set the entry belongs to a timed-out single-key park and
/// `timed_out` is reported under the lock.
fn retire_entry(entry: &WaitEntry, timed_out_flag: bool, timed_out: impl FnOnce(usize, bool)) {
    loop {
        let key = entry.key();
        let mut bucket = lock_bucket(key);
        if entry.key() != key {
            // Requeued between the key load and the lock; chase it.
            continue;
        }
        if entry.is_queued() {
            // Safety: the entry is queued in this bucket's list and we hold
            // its lock.
            unsafe {
                bucket.queue.remove(NonNull::from(entry));
            }
            entry.set_queued(false);
            if timed_out_flag {
                let was_last = !bucket.has_waiter_for(key);
                timed_out(key, was_last);
            }
        }
        return;
    }
}

/// The wake target for the calling context.
fn current_target() -> WakeTarget {
    match task::current() {
        Some(task) => WakeTarget::Task(task),
        None => WakeTarget::Thread(std::thread::current()),
    }
}

/// Suspends the calling context until its slot is claimed.
fn wait_for_claim(slot: &Arc<WakeSlot>, deadline: Option<Instant>) {
    match slot.target() {
        WakeTarget::Thread(_) => slot.block(deadline),
        WakeTarget::Task(task) => {
            if let Some(deadline) = deadline {
                task.pool().register_deadline(deadline, slot.clone());
            }
            task::suspend_parked(task);
        }
    }
}

impl WakeTarget {
    fn deliver(self) {
        match self {
            WakeTarget::Thread(thread) => thread.unpark(),
            WakeTarget::Task(task) => task.wake(),
        }
    }
}
