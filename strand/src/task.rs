//! Tasks: user work items executed as stackful coroutines.
//!
//! A [`Task`] is a description — label, batch count, entry closure — owned by
//! a command buffer until the pool dispatches it. At dispatch the pool wraps
//! it in a `TaskCore` with a coroutine, a state word and its scheduling
//! links, and from then on the task runs cooperatively: it owns a worker
//! thread until it yields, parks, finishes or aborts.
//!
//! The free functions in this module ([`yield_now`], [`sleep`], [`abort`],
//! [`cancel_requested`], [`task_id`]) act on the *current* task, found
//! through a thread-local the worker installs around every resume.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::num::NonZeroU64;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cordyceps::{Linked, mpsc_queue};
use coro::stack::OsStack;

use crate::cmd::BufCore;
use crate::error::NotATask;
use crate::exec::{PoolInner, WorkerId};
use crate::time;
use crate::tls::{self, TssMap};

/// Pool-unique identifier of a live task. Identifiers may be reused after a
/// task exits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub(crate) fn next() -> TaskId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let id = NEXT.fetch_add(1, Ordering::Relaxed);
        TaskId(NonZeroU64::new(id).expect("task id counter wrapped"))
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work: an entry closure invoked once per batch index.
pub struct Task {
    pub(crate) label: Option<Cow<'static, str>>,
    pub(crate) batch: usize,
    pub(crate) entry: Box<dyn Fn(usize) + Send + 'static>,
}

impl Task {
    /// Single-shot task running `entry` once.
    pub fn new(entry: impl Fn(usize) + Send + 'static) -> Task {
        TaskBuilder::new().build(entry)
    }

    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

/// Configures a [`Task`] before it is built.
#[derive(Default)]
pub struct TaskBuilder {
    label: Option<Cow<'static, str>>,
    batch: Option<usize>,
}

impl TaskBuilder {
    pub fn new() -> TaskBuilder {
        Self::default()
    }

    /// Attaches a label, carried for the task's entire lifetime and surfaced
    /// in trace output.
    #[must_use]
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> TaskBuilder {
        self.label = Some(label.into());
        self
    }

    /// Number of times the entry closure runs, once per index `0..batch`.
    ///
    /// # Panics
    ///
    /// Panics if `batch` is zero.
    #[must_use]
    pub fn batch(mut self, batch: usize) -> TaskBuilder {
        assert!(batch >= 1, "batch count must be at least 1");
        self.batch = Some(batch);
        self
    }

    pub fn build(self, entry: impl Fn(usize) + Send + 'static) -> Task {
        Task {
            label: self.label,
            batch: self.batch.unwrap_or(1),
            entry: Box::new(entry),
        }
    }
}

/// Why a running task handed control back to its worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SwitchReason {
    /// `yield_now`: put me back on the ready queue.
    Yielded,
    /// The task queued itself in the parking lot; a wake re-enqueues it.
    Parked,
}

/// Terminal result of a task's coroutine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Exit {
    Completed,
    Aborted,
}

pub(crate) type TaskControl = coro::Control<(), SwitchReason, Exit>;
pub(crate) type TaskCoro = coro::Coro<(), SwitchReason, Exit, OsStack>;

/// Task scheduling states.
mod state {
    /// In a ready queue (or being pushed into one).
    pub(super) const READY: u8 = 0;
    /// On a worker's CPU.
    pub(super) const RUNNING: u8 = 1;
    /// Switching out after queueing in the parking lot.
    pub(super) const PARKING: u8 = 2;
    /// Fully suspended; a wake may claim it.
    pub(super) const PARKED: u8 = 3;
    /// A wake arrived during RUNNING/PARKING; consume instead of suspending.
    pub(super) const WOKEN: u8 = 4;
}

/// Runtime representation of a dispatched task.
pub(crate) struct TaskCore {
    id: TaskId,
    label: Option<Cow<'static, str>>,
    state: AtomicU8,
    /// Intrusive links for the ready queues. A task is in at most one queue
    /// at any time.
    run_links: mpsc_queue::Links<TaskCore>,
    /// Worker this task is pinned to, if its buffer selected one.
    pin: Option<WorkerId>,
    /// The owning pool. `None` only for queue stub nodes.
    pool: Option<Arc<PoolInner>>,
    /// The owning command buffer and the index of the command that spawned
    /// this task. `None` only for queue stub nodes.
    buf: Option<Arc<BufCore>>,
    cmd_index: usize,
    batch: usize,
    entry: Option<Box<dyn Fn(usize) + Send + 'static>>,
    /// The coroutine. Accessed only by the worker currently executing or
    /// finalizing the task.
    coro: UnsafeCell<Option<TaskCoro>>,
    /// Suspension handle, published by the coroutine body on first entry and
    /// only ever dereferenced from inside the coroutine.
    control: UnsafeCell<Option<NonNull<TaskControl>>>,
    /// Task-local storage, accessed only from the task itself.
    tss: UnsafeCell<TssMap>,
}

pub(crate) type TaskRef = Arc<TaskCore>;

// Safety: the UnsafeCell fields are single-owner by protocol — `coro` is
// touched only by the worker that dequeued the task, `control` and `tss`
// only from inside the coroutine — and everything else is atomic or
// immutable after construction.
unsafe impl Send for TaskCore {}
// Safety: see above.
unsafe impl Sync for TaskCore {}

impl TaskCore {
    pub(crate) fn new(
        task: Task,
        pool: Arc<PoolInner>,
        buf: Arc<BufCore>,
        cmd_index: usize,
        pin: Option<WorkerId>,
    ) -> TaskRef {
        Arc::new(TaskCore {
            id: TaskId::next(),
            label: task.label,
            state: AtomicU8::new(state::READY),
            run_links: mpsc_queue::Links::new(),
            pin,
            pool: Some(pool),
            buf: Some(buf),
            cmd_index,
            batch: task.batch,
            entry: Some(task.entry),
            coro: UnsafeCell::new(None),
            control: UnsafeCell::new(None),
            tss: UnsafeCell::new(TssMap::new()),
        })
    }

    /// A placeholder node for the intrusive ready queues. Never executed.
    pub(crate) fn new_stub() -> TaskRef {
        Arc::new(TaskCore {
            id: TaskId::next(),
            label: None,
            state: AtomicU8::new(state::READY),
            run_links: mpsc_queue::Links::new_stub(),
            pin: None,
            pool: None,
            buf: None,
            cmd_index: 0,
            batch: 0,
            entry: None,
            coro: UnsafeCell::new(None),
            control: UnsafeCell::new(None),
            tss: UnsafeCell::new(TssMap::new()),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn pin(&self) -> Option<WorkerId> {
        self.pin
    }

    pub(crate) fn pool(&self) -> &Arc<PoolInner> {
        self.pool.as_ref().expect("stub task has no pool")
    }

    pub(crate) fn buf(&self) -> Option<&Arc<BufCore>> {
        self.buf.as_ref()
    }

    pub(crate) fn cmd_index(&self) -> usize {
        self.cmd_index
    }

    /// Installs the coroutine at dispatch time.
    ///
    /// # Safety
    ///
    /// Caller must be the sole owner of the task at this point (the
    /// dispatcher, before the task is ever enqueued).
    pub(crate) unsafe fn install_coro(&self, coro: TaskCoro) {
        // Safety: ensured by caller
        unsafe { *self.coro.get() = Some(coro) };
    }

    /// Mutable access to the coroutine.
    ///
    /// # Safety
    ///
    /// Caller must be the worker currently executing or finalizing this
    /// task; no other access may exist concurrently.
    #[expect(clippy::mut_from_ref, reason = "single-owner protocol, see safety docs")]
    pub(crate) unsafe fn coro_mut(&self) -> &mut Option<TaskCoro> {
        // Safety: ensured by caller
        unsafe { &mut *self.coro.get() }
    }

    pub(crate) fn set_running(&self) {
        self.state.store(state::RUNNING, Ordering::Relaxed);
    }

    /// Marks a yielded task runnable again before re-enqueueing it.
    pub(crate) fn set_ready(&self) {
        self.state.store(state::READY, Ordering::Relaxed);
    }

    /// Worker-side bookkeeping after the coroutine switched out with
    /// [`SwitchReason::Parked`]: commit the park, or — if a wake raced in —
    /// report that the task must be re-enqueued immediately.
    pub(crate) fn commit_park(&self) -> bool {
        match self.state.compare_exchange(
            state::PARKING,
            state::PARKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(actual) => {
                debug_assert_eq!(actual, state::WOKEN);
                self.state.store(state::READY, Ordering::Relaxed);
                false
            }
        }
    }

    /// Makes a parked (or about-to-park) task runnable again. Called by
    /// whoever claimed its wake slot.
    pub(crate) fn wake(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let target = match current {
                state::PARKED => state::READY,
                state::RUNNING | state::PARKING => state::WOKEN,
                // Already runnable or already carrying a wakeup.
                state::READY | state::WOKEN => return,
                other => unreachable!("task in impossible state {other}"),
            };
            match self.state.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == state::PARKED {
                        self.pool().resched(self.clone());
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// Safety: `run_links` addresses the queue links; handles are `Arc`s whose
// refcount carries queue ownership, and a task is in at most one queue at a
// time by the state protocol above.
unsafe impl Linked<mpsc_queue::Links<TaskCore>> for TaskCore {
    type Handle = TaskRef;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        NonNull::new(Arc::into_raw(handle).cast_mut()).expect("Arc pointer is never null")
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: `ptr` came out of `into_ptr`.
        unsafe { Arc::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        // Safety: field projection on a valid task pointer.
        unsafe { NonNull::new_unchecked(&raw mut (*target.as_ptr()).run_links) }
    }
}

thread_local! {
    static CURRENT_TASK: Cell<Option<NonNull<TaskCore>>> = const { Cell::new(None) };
}

/// Installs (or clears) the current-task pointer for this worker thread.
/// Returns the previous value so nested resumes could restore it.
pub(crate) fn install_current(task: Option<NonNull<TaskCore>>) -> Option<NonNull<TaskCore>> {
    CURRENT_TASK.with(|cell| cell.replace(task))
}

/// The task currently executing on this thread, if any.
pub(crate) fn current() -> Option<TaskRef> {
    let ptr = CURRENT_TASK.with(Cell::get)?;
    // Safety: the worker holds a strong reference for as long as the pointer
    // is installed, so resurrecting another one is sound.
    unsafe {
        Arc::increment_strong_count(ptr.as_ptr());
        Some(Arc::from_raw(ptr.as_ptr()))
    }
}

/// Runs `f` with the current task's storage map.
///
/// `f` must not itself touch task-local storage; callers in [`crate::tls`]
/// keep their closures free of reentry and run destructors only after the
/// borrow ends.
pub(crate) fn with_current_tss<R>(f: impl FnOnce(&mut TssMap) -> R) -> Result<R, NotATask> {
    let ptr = CURRENT_TASK.with(Cell::get).ok_or(NotATask(()))?;
    // Safety: only the task itself reaches its tss cell, and `f` does not
    // re-enter (see above).
    let map = unsafe { &mut *ptr.as_ref().tss.get() };
    Ok(f(map))
}

/// Suspends the current task after it queued itself in the parking lot.
///
/// Must be called from inside the task's coroutine. If the wake already
/// arrived (claimed between queueing and here), returns without switching.
pub(crate) fn suspend_parked(task: &TaskRef) {
    let begun = task
        .state
        .compare_exchange(
            state::RUNNING,
            state::PARKING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();

    if begun {
        suspend_current(SwitchReason::Parked);
    } else {
        // The claim raced ahead of us; consume the wakeup in place.
        debug_assert_eq!(task.state.load(Ordering::Relaxed), state::WOKEN);
        task.state.store(state::RUNNING, Ordering::Relaxed);
    }
}

/// Switches from the current task's coroutine back to its worker.
fn suspend_current(reason: SwitchReason) {
    let ptr = CURRENT_TASK
        .with(Cell::get)
        .expect("suspend outside a task");
    // Safety: we are inside this task's coroutine, so the control pointer is
    // published and valid.
    let control = unsafe {
        (*ptr.as_ref().control.get()).expect("task coroutine has no control handle")
    };
    // Safety: same as above; the handle stays valid across the switch.
    unsafe { control.as_ref().suspend(reason) }
}

/// Builds the coroutine for a dispatched task.
///
/// The body deliberately captures nothing: it finds its `TaskCore` through
/// the worker's current-task pointer, so an [`abort`] (which abandons stack
/// frames without dropping them) cannot leak strong references.
pub(crate) fn make_coro(stack: OsStack) -> TaskCoro {
    coro::Coro::new(stack, |(), control: &TaskControl| {
        let ptr = CURRENT_TASK
            .with(Cell::get)
            .expect("task coroutine started outside a worker");
        // Safety: the worker holds the task alive while the coroutine runs.
        let task = unsafe { ptr.as_ref() };

        // Safety: first entry; nobody else touches the control cell.
        unsafe { *task.control.get() = Some(NonNull::from(control)) };

        tracing::trace!(id = %task.id, label = task.label(), "task started");

        let entry = task.entry.as_ref().expect("dispatched a stub task");
        let mut aborted = false;
        for index in 0..task.batch {
            match std::panic::catch_unwind(AssertUnwindSafe(|| entry(index))) {
                Ok(()) => {}
                Err(payload) => {
                    tracing::error!(
                        id = %task.id,
                        index,
                        "task panicked; treating as abort"
                    );
                    drop(payload);
                    aborted = true;
                    break;
                }
            }
        }

        if aborted {
            if let Some(buf) = task.buf() {
                buf.mark_cancelled();
            }
        }

        tls::run_exit_dtors();

        tracing::trace!(id = %task.id, ?aborted, "task exiting");
        if aborted { Exit::Aborted } else { Exit::Completed }
    })
}

/// Re-enqueues the current task at the tail of its worker's ready queue and
/// runs other work. From a non-task thread this is an OS-level yield.
pub fn yield_now() {
    if CURRENT_TASK.with(Cell::get).is_some() {
        suspend_current(SwitchReason::Yielded);
    } else {
        std::thread::yield_now();
    }
}

/// Suspends the current task for at least `duration` on the monotonic clock.
/// From a non-task thread this is an OS-level sleep.
pub fn sleep(duration: Duration) {
    let Some(task) = current() else {
        std::thread::sleep(duration);
        return;
    };

    let deadline = time::Instant::now().saturating_add(duration);
    // Park on our own address: nothing ever wakes this key, so the park
    // always times out at the deadline.
    let key = Arc::as_ptr(&task) as usize;
    let result = crate::park::park(key, || true, || {}, |_, _| {}, 0, Some(deadline));
    debug_assert!(matches!(
        result,
        crate::park::ParkResult::TimedOut | crate::park::ParkResult::Unparked(_)
    ));
}

/// Terminates the current task immediately, marking its command buffer as
/// cancelled.
///
/// Task-local destructors run; stack frames between the entry closure and
/// this call are abandoned *without* running their destructors, so held
/// locks are not released — don't call this while holding one.
///
/// # Panics
///
/// Panics if the caller is not a task.
pub fn abort() -> ! {
    let ptr = CURRENT_TASK
        .with(Cell::get)
        .expect("abort called outside a task");
    // Safety: we are inside this task's coroutine.
    let task = unsafe { ptr.as_ref() };

    tracing::debug!(id = %task.id, "task aborting");
    if let Some(buf) = task.buf() {
        buf.mark_cancelled();
    }

    tls::run_exit_dtors();

    // Safety: published on coroutine entry, valid while the task runs.
    let control = unsafe {
        (*task.control.get()).expect("task coroutine has no control handle")
    };
    // Safety: terminal switch back to the worker; never returns.
    unsafe { control.as_ref().finish(Exit::Aborted) }
}

/// Whether cancellation has been requested for the current task's command
/// buffer. Advisory: tasks are expected to check this at yield points and
/// return early. Always false outside a task.
pub fn cancel_requested() -> bool {
    match current() {
        Some(task) => task.buf().is_some_and(|buf| buf.cancelled()),
        None => false,
    }
}

/// The current task's identifier, `None` off-worker.
pub fn task_id() -> Option<TaskId> {
    current().map(|task| task.id())
}

/// The current worker's identifier, `None` off-worker.
pub fn worker_id() -> Option<WorkerId> {
    crate::exec::current_worker_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let task = Task::new(|_| {});
        assert_eq!(task.batch, 1);
        assert!(task.label.is_none());

        let task = Task::builder().label("indexer").batch(16).build(|_| {});
        assert_eq!(task.batch, 16);
        assert_eq!(task.label.as_deref(), Some("indexer"));
    }

    #[test]
    #[should_panic(expected = "batch count must be at least 1")]
    fn zero_batch_rejected() {
        let _ = Task::builder().batch(0);
    }

    #[test]
    fn off_worker_queries() {
        assert_eq!(task_id(), None);
        assert_eq!(worker_id(), None);
        assert!(!cancel_requested());
        // Off-worker yield and sleep degrade to their OS equivalents.
        yield_now();
        sleep(Duration::from_millis(1));
    }

    #[test]
    fn ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
    }
}
