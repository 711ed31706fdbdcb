//! Command buffers: the unit of admission into a pool.
//!
//! A buffer is an immutable, ordered list of scheduler directives built once
//! and then submitted. The pool's workers *drive* a submitted buffer: they
//! walk its commands in program order, spawning tasks as they go; the spawned
//! tasks themselves run concurrently, and ordering between commands exists
//! only where a barrier or an indirect wait asks for it.
//!
//! Submitting returns a [`CommandBufferHandle`], the caller's exclusive
//! capability on the buffer. Every handle operation consumes it: `join`
//! awaits completion, `detach` abandons it (cleanup still happens), `cancel`
//! signals cancellation and joins, `cancel_detach` signals and abandons.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::borrow::Cow;
use std::sync::Arc;

use spin::Mutex;

use crate::exec::{PoolInner, WorkerId};
use crate::futex::{self, Filter, Width};
use crate::task::Task;

/// One directive in a command buffer.
pub enum Command {
    /// Pin subsequent [`Command::Enqueue`]s to one worker.
    SelectWorker(WorkerId),
    /// Clear the worker pin.
    AnyWorker,
    /// Submit a task to the run queue chosen by the current selection.
    Enqueue(Task),
    /// Complete only after every prior `Enqueue` of this buffer completed.
    Barrier,
    /// Complete only after the command `k` positions back completed
    /// (transitively waiting on whatever that command waits on).
    WaitIndirect(usize),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SelectWorker(w) => f.debug_tuple("SelectWorker").field(w).finish(),
            Command::AnyWorker => f.write_str("AnyWorker"),
            Command::Enqueue(task) => f.debug_tuple("Enqueue").field(task).finish(),
            Command::Barrier => f.write_str("Barrier"),
            Command::WaitIndirect(k) => f.debug_tuple("WaitIndirect").field(k).finish(),
        }
    }
}

/// An immutable ordered list of commands plus an optional label and an
/// optional deinit callback.
pub struct CommandBuffer {
    pub(crate) label: Option<Cow<'static, str>>,
    pub(crate) cmds: Vec<Command>,
    pub(crate) deinit: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CommandBuffer {
    pub fn builder() -> CommandBufferBuilder {
        CommandBufferBuilder::default()
    }

    /// A buffer submitting a single unpinned task.
    pub fn single(task: Task) -> CommandBuffer {
        Self::builder().enqueue(task).build()
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("label", &self.label)
            .field("cmds", &self.cmds)
            .finish_non_exhaustive()
    }
}

/// Builds a [`CommandBuffer`].
#[derive(Default)]
pub struct CommandBufferBuilder {
    label: Option<Cow<'static, str>>,
    cmds: Vec<Command>,
    deinit: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CommandBufferBuilder {
    #[must_use]
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Pins subsequent tasks to `worker`.
    #[must_use]
    pub fn select_worker(mut self, worker: WorkerId) -> Self {
        self.cmds.push(Command::SelectWorker(worker));
        self
    }

    /// Clears any worker pin.
    #[must_use]
    pub fn any_worker(mut self) -> Self {
        self.cmds.push(Command::AnyWorker);
        self
    }

    #[must_use]
    pub fn enqueue(mut self, task: Task) -> Self {
        self.cmds.push(Command::Enqueue(task));
        self
    }

    /// Waits for every task enqueued so far by this buffer.
    #[must_use]
    pub fn barrier(mut self) -> Self {
        self.cmds.push(Command::Barrier);
        self
    }

    /// Waits for the command `k` positions before this one.
    #[must_use]
    pub fn wait_indirect(mut self, k: usize) -> Self {
        self.cmds.push(Command::WaitIndirect(k));
        self
    }

    /// Callback invoked exactly once after the buffer has drained and every
    /// handle reference is gone. It runs outside all runtime locks and may
    /// submit new buffers.
    #[must_use]
    pub fn deinit(mut self, deinit: impl FnOnce() + Send + 'static) -> Self {
        self.deinit = Some(Box::new(deinit));
        self
    }

    pub fn build(self) -> CommandBuffer {
        CommandBuffer {
            label: self.label,
            cmds: self.cmds,
            deinit: self.deinit,
        }
    }
}

/// Terminal state of a submitted command buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompletionStatus {
    /// Every task returned from its entry function without aborting and no
    /// cancellation was signalled.
    Completed,
    /// Cancellation was signalled, a task aborted, or a spawn failed.
    Cancelled,
}

/// Buffer lifecycle values of [`BufCore::state`], the futex word `join`
/// sleeps on.
const RUNNING: u32 = 0;
const COMPLETED: u32 = 1;
const CANCELLED: u32 = 2;

/// A command in dispatch form: `Enqueue` payloads are taken out when they
/// are spawned.
enum CmdSlot {
    Select(Option<WorkerId>),
    Enqueue(Option<Task>),
    Barrier,
    WaitIndirect(usize),
}

/// What a parked buffer driver is waiting for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WaitOn {
    /// The pool's live-task cap; retried when a task exits.
    Capacity,
    /// The barrier at this command index.
    Barrier(usize),
    /// Completion of the command at this index.
    Cmd(usize),
}

struct Dispatch {
    cmds: Vec<CmdSlot>,
    next: usize,
    selection: Option<WorkerId>,
    waiting: Option<WaitOn>,
    /// Set when a spawn failure aborted the rest of the buffer.
    aborted: bool,
}

/// Pool-side state of a submitted buffer.
pub(crate) struct BufCore {
    label: Option<Cow<'static, str>>,
    /// `RUNNING` until the buffer drains; then the completion status.
    /// `join` futex-waits on this word.
    state: AtomicU32,
    cancelled: AtomicBool,
    /// Spawned but unfinished tasks.
    outstanding: AtomicUsize,
    /// Logical owners gating `deinit`: the pool (until completion) and the
    /// handle (until consumed/dropped).
    refs: AtomicUsize,
    cursor: Mutex<Dispatch>,
    /// Per-command completion; for `Enqueue` set when the task finishes,
    /// for everything else when the dispatcher passes it.
    done: Vec<AtomicBool>,
    deinit: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    pool: Arc<PoolInner>,
}

impl BufCore {
    pub(crate) fn new(buffer: CommandBuffer, pool: Arc<PoolInner>, refs: usize) -> Arc<BufCore> {
        let done = buffer.cmds.iter().map(|_| AtomicBool::new(false)).collect();
        let cmds = buffer
            .cmds
            .into_iter()
            .map(|cmd| match cmd {
                Command::SelectWorker(w) => CmdSlot::Select(Some(w)),
                Command::AnyWorker => CmdSlot::Select(None),
                Command::Enqueue(task) => CmdSlot::Enqueue(Some(task)),
                Command::Barrier => CmdSlot::Barrier,
                Command::WaitIndirect(k) => CmdSlot::WaitIndirect(k),
            })
            .collect();

        Arc::new(BufCore {
            label: buffer.label,
            state: AtomicU32::new(RUNNING),
            cancelled: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            refs: AtomicUsize::new(refs),
            cursor: Mutex::new(Dispatch {
                cmds,
                next: 0,
                selection: None,
                waiting: None,
                aborted: false,
            }),
            done,
            deinit: Mutex::new(buffer.deinit),
            pool,
        })
    }

    pub(crate) fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Signals cancellation: advisory for running tasks, terminal-state
    /// defining for the buffer.
    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Drives dispatch forward until the buffer blocks or every command has
    /// been issued. Runs on workers; the cursor lock makes drivers mutually
    /// exclusive and re-driving idempotent.
    pub(crate) fn drive(self: &Arc<Self>) {
        let mut d = self.cursor.lock();
        d.waiting = None;

        while d.next < d.cmds.len() && !d.aborted {
            let i = d.next;
            match &mut d.cmds[i] {
                CmdSlot::Select(sel) => {
                    d.selection = *sel;
                    self.done[i].store(true, Ordering::Release);
                    d.next += 1;
                }
                CmdSlot::Barrier => {
                    if self.enqueues_done_before(i, &d.cmds) {
                        self.done[i].store(true, Ordering::Release);
                        d.next += 1;
                    } else {
                        d.waiting = Some(WaitOn::Barrier(i));
                        return;
                    }
                }
                CmdSlot::WaitIndirect(k) => {
                    let k = *k;
                    debug_assert!(k >= 1 && k <= i, "indirect wait outside the buffer");
                    match (k >= 1).then(|| i.checked_sub(k)).flatten() {
                        Some(target) => {
                            if self.done[target].load(Ordering::Acquire) {
                                self.done[i].store(true, Ordering::Release);
                                d.next += 1;
                            } else {
                                d.waiting = Some(WaitOn::Cmd(target));
                                return;
                            }
                        }
                        // Out-of-range waits are programmer bugs; treat as
                        // satisfied in release builds.
                        None => {
                            self.done[i].store(true, Ordering::Release);
                            d.next += 1;
                        }
                    }
                }
                CmdSlot::Enqueue(slot) => {
                    if !self.pool.try_acquire_live_slot() {
                        d.waiting = Some(WaitOn::Capacity);
                        drop(d);
                        self.pool.push_capacity_waiter(self.clone());
                        return;
                    }

                    let task = slot.take().expect("command dispatched twice");
                    let pin = d.selection;
                    // Counted before the task becomes visible; it may finish
                    // (and decrement) before spawn_task even returns.
                    self.outstanding.fetch_add(1, Ordering::AcqRel);
                    match self.pool.spawn_task(task, self.clone(), i, pin) {
                        Ok(()) => d.next += 1,
                        Err(err) => {
                            tracing::error!(
                                buffer = self.label().unwrap_or(""),
                                %err,
                                "stack allocation failed, aborting command buffer"
                            );
                            self.outstanding.fetch_sub(1, Ordering::AcqRel);
                            self.pool.release_live_slot();
                            self.mark_cancelled();
                            d.aborted = true;
                        }
                    }
                }
            }
        }

        drop(d);
        self.maybe_complete();
    }

    /// Whether every `Enqueue` before command `i` has completed.
    fn enqueues_done_before(&self, i: usize, cmds: &[CmdSlot]) -> bool {
        cmds[..i]
            .iter()
            .enumerate()
            .filter(|(_, cmd)| matches!(cmd, CmdSlot::Enqueue(_)))
            .all(|(j, _)| self.done[j].load(Ordering::Acquire))
    }

    /// Called by the worker that finalized one of this buffer's tasks.
    pub(crate) fn task_finished(self: &Arc<Self>, cmd_index: usize, aborted: bool) {
        if aborted {
            self.mark_cancelled();
        }
        self.done[cmd_index].store(true, Ordering::Release);
        let remaining = self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;

        // A parked driver may have become runnable.
        let resume = {
            let d = self.cursor.lock();
            match d.waiting {
                Some(WaitOn::Barrier(i)) => self.enqueues_done_before(i, &d.cmds),
                Some(WaitOn::Cmd(target)) => self.done[target].load(Ordering::Acquire),
                Some(WaitOn::Capacity) | None => false,
            }
        };

        if resume {
            self.pool.push_pending(self.clone());
        } else if remaining == 0 {
            self.maybe_complete();
        }
    }

    /// Completes the buffer once dispatch has finished and no task is
    /// outstanding. Idempotent.
    fn maybe_complete(self: &Arc<Self>) {
        let dispatched = {
            let d = self.cursor.lock();
            d.aborted || d.next >= d.cmds.len()
        };
        if !dispatched || self.outstanding.load(Ordering::Acquire) != 0 {
            return;
        }

        let status = if self.cancelled() { CANCELLED } else { COMPLETED };
        if self
            .state
            .compare_exchange(RUNNING, status, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        tracing::debug!(
            buffer = self.label().unwrap_or(""),
            cancelled = status == CANCELLED,
            "command buffer completed"
        );

        // Safety: the state word is owned by this BufCore, which outlives
        // the wake.
        unsafe {
            let _ = futex::wake(
                core::ptr::from_ref(&self.state).cast(),
                usize::MAX,
                Filter::ALL,
            );
        }

        self.pool.buffer_completed();
        self.release_ref();
    }

    /// Completes a buffer the pool refused to admit. The handle (if any)
    /// observes `Cancelled`; no task ever ran.
    pub(crate) fn complete_rejected(self: &Arc<Self>) {
        self.mark_cancelled();
        self.state.store(CANCELLED, Ordering::Release);
        // Safety: as in maybe_complete.
        unsafe {
            let _ = futex::wake(
                core::ptr::from_ref(&self.state).cast(),
                usize::MAX,
                Filter::ALL,
            );
        }
        self.release_ref();
    }

    /// Blocks the calling context (task or foreign thread) until the buffer
    /// reaches a terminal state.
    pub(crate) fn wait_completed(&self) -> CompletionStatus {
        loop {
            match self.state.load(Ordering::Acquire) {
                RUNNING => {
                    // Safety: the state word is live for the wait; Invalid
                    // just means the state changed under us.
                    let _ = unsafe {
                        futex::wait(
                            core::ptr::from_ref(&self.state).cast(),
                            Width::U32,
                            u64::from(RUNNING),
                            0,
                            None,
                        )
                    };
                }
                COMPLETED => return CompletionStatus::Completed,
                _ => return CompletionStatus::Cancelled,
            }
        }
    }

    /// Drops one logical owner; the last one runs `deinit`.
    pub(crate) fn release_ref(self: &Arc<Self>) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let deinit = self.deinit.lock().take();
            if let Some(deinit) = deinit {
                deinit();
            }
        }
    }
}

impl fmt::Debug for BufCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufCore")
            .field("label", &self.label)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The caller's exclusive capability on a submitted buffer.
///
/// Dropping the handle is equivalent to [`detach`](CommandBufferHandle::detach).
#[must_use = "dropping a handle detaches the buffer"]
pub struct CommandBufferHandle {
    core: Option<Arc<BufCore>>,
}

impl CommandBufferHandle {
    pub(crate) fn new(core: Arc<BufCore>) -> CommandBufferHandle {
        CommandBufferHandle { core: Some(core) }
    }

    /// Blocks until the buffer completes and returns its terminal status.
    pub fn join(mut self) -> CompletionStatus {
        let core = self.core.take().expect("handle already consumed");
        let status = core.wait_completed();
        core.release_ref();
        status
    }

    /// Abandons ownership; buffer cleanup happens on completion.
    pub fn detach(mut self) {
        if let Some(core) = self.core.take() {
            core.release_ref();
        }
    }

    /// Signals cancellation and waits for the buffer to finish.
    ///
    /// Cancellation is advisory for the buffer's tasks: they observe it via
    /// [`cancel_requested`](crate::task::cancel_requested) and are expected
    /// to return early.
    pub fn cancel(mut self) -> CompletionStatus {
        let core = self.core.take().expect("handle already consumed");
        core.mark_cancelled();
        let status = core.wait_completed();
        core.release_ref();
        status
    }

    /// Signals cancellation and abandons ownership.
    pub fn cancel_detach(mut self) {
        if let Some(core) = self.core.take() {
            core.mark_cancelled();
            core.release_ref();
        }
    }
}

impl Drop for CommandBufferHandle {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.release_ref();
        }
    }
}

impl fmt::Debug for CommandBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferHandle")
            .field("core", &self.core)
            .finish()
    }
}
