//! The worker pool: a fixed set of OS threads running cooperative tasks.
//!
//! Each worker owns a local ready queue; a shared injector queue catches
//! work produced off-pool. The worker loop is strictly ordered: local queue,
//! injector, pending command buffers, timer, sleep. Admission of command
//! buffers is a bounded ring guarded by the runtime's own mutex/condition,
//! so a submitter blocks correctly whether it is a task or a foreign thread.

mod arena;
mod idle;
mod queue;
mod timer;

use core::fmt;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use spin::Mutex as SpinMutex;

use crate::cmd::{BufCore, CommandBuffer, CommandBufferHandle};
use crate::futex::{self, Filter, Width};
use crate::park::WakeSlot;
use crate::sync::{Condition, Mutex};
use crate::task::{self, Exit, SwitchReason, Task, TaskCore, TaskRef};
use crate::time::Instant;

use arena::StackArena;
use idle::IdleSet;
use queue::RunQueue;
use timer::Timer;

use coro::CoroResult;

/// Identifies one worker thread of a pool. Non-zero so an optional id packs
/// into a word.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WorkerId(NonZeroUsize);

impl WorkerId {
    pub(crate) fn from_index(index: usize) -> WorkerId {
        WorkerId(NonZeroUsize::new(index + 1).expect("worker index overflow"))
    }

    /// Zero-based position of this worker within its pool.
    pub fn index(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.index())
    }
}

/// Pool construction options. Zero (or false) means "use the default".
#[derive(Copy, Clone, Debug, Default)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Command buffers admitted (and not yet completed) at once; further
    /// submitters block.
    pub cmd_buf_capacity: usize,
    /// Live-task cap multiplier: at most `worker_count · max_load_factor`
    /// tasks hold stacks concurrently.
    pub max_load_factor: usize,
    /// Minimum coroutine stack size in bytes.
    pub stack_size: usize,
    /// Free stacks retained per worker.
    pub worker_stack_cache_len: usize,
    /// Release every stack to the OS immediately.
    pub disable_stack_cache: bool,
    /// Skip the inaccessible guard page below each stack.
    pub disable_stack_guard: bool,
}

const DEFAULT_CMD_BUF_CAPACITY: usize = 64;
const DEFAULT_MAX_LOAD_FACTOR: usize = 16;
const DEFAULT_STACK_SIZE: usize = 256 * 1024;
const DEFAULT_STACK_CACHE_LEN: usize = 4;

/// Pool lifecycle values of [`PoolInner::state`], the futex word `join`
/// sleeps on.
const OPEN: u32 = 0;
const JOINING: u32 = 1;
const DRAINED: u32 = 2;

pub(crate) struct PoolInner {
    /// `OPEN` until a join is requested, `DRAINED` once the last admitted
    /// buffer completed and workers may exit.
    state: AtomicU32,
    locals: Vec<RunQueue>,
    injector: RunQueue,
    /// Buffers with dispatch work pending; any worker may drive them.
    pending: SpinMutex<VecDeque<Arc<BufCore>>>,
    /// Buffers blocked on the live-task cap; resumed as tasks exit.
    capacity_waiters: SpinMutex<Vec<Arc<BufCore>>>,
    live: AtomicUsize,
    max_live: usize,
    arena: StackArena,
    timer: Timer,
    idle: IdleSet,
    /// Admission ring: `in_flight` is only written under `ring`.
    ring: Mutex,
    not_full: Condition,
    in_flight: AtomicUsize,
    cmd_buf_capacity: usize,
    threads: SpinMutex<Vec<JoinHandle<()>>>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<(WorkerId, Arc<PoolInner>)>> =
        const { RefCell::new(None) };
}

pub(crate) fn current_worker_id() -> Option<WorkerId> {
    CURRENT_WORKER.with(|cell| cell.borrow().as_ref().map(|(id, _)| *id))
}

impl PoolInner {
    /// Makes `task` runnable: pinned tasks go to their worker, everything
    /// else stays local to the waking worker or falls into the injector.
    pub(crate) fn resched(self: &Arc<Self>, task: TaskRef) {
        if let Some(worker) = task.pin() {
            self.locals[worker.index()].push(task);
            self.idle.notify_worker(worker);
            return;
        }

        let local = CURRENT_WORKER.with(|cell| {
            let current = cell.borrow();
            current
                .as_ref()
                .and_then(|(id, pool)| Arc::ptr_eq(pool, self).then_some(*id))
        });

        match local {
            // This worker is awake and will see its queue on the next loop.
            Some(id) => self.locals[id.index()].push(task),
            None => {
                self.injector.push(task);
                self.idle.notify_one();
            }
        }
    }

    /// Spawns a dispatched task: stack, coroutine, ready queue.
    pub(crate) fn spawn_task(
        self: &Arc<Self>,
        task: Task,
        buf: Arc<BufCore>,
        cmd_index: usize,
        pin: Option<WorkerId>,
    ) -> io::Result<()> {
        let stack = self.arena.acquire()?;
        let task = TaskCore::new(task, self.clone(), buf, cmd_index, pin);
        // Safety: the task is not published yet; we are its sole owner.
        unsafe { task.install_coro(task::make_coro(stack)) };
        tracing::trace!(id = %task.id(), label = task.label(), "spawned task");
        self.resched(task);
        Ok(())
    }

    /// Reserves a live-task slot, failing when the pool is at its cap.
    pub(crate) fn try_acquire_live_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_live).then_some(live + 1)
            })
            .is_ok()
    }

    /// Releases a live-task slot and resumes one capacity-blocked buffer.
    pub(crate) fn release_live_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        let waiter = self.capacity_waiters.lock().pop();
        if let Some(buf) = waiter {
            self.push_pending(buf);
        }
    }

    pub(crate) fn push_pending(&self, buf: Arc<BufCore>) {
        self.pending.lock().push_back(buf);
        self.idle.notify_one();
    }

    pub(crate) fn push_capacity_waiter(&self, buf: Arc<BufCore>) {
        self.capacity_waiters.lock().push(buf);
        // A slot may have freed between the failed acquire and the
        // registration above; without this recheck that release could have
        // found an empty waiter list and the buffer would stall.
        if self.live.load(Ordering::Acquire) < self.max_live {
            let waiter = self.capacity_waiters.lock().pop();
            if let Some(buf) = waiter {
                self.push_pending(buf);
            }
        }
    }

    /// Registers a park deadline, nudging a sleeping worker when it became
    /// the earliest.
    pub(crate) fn register_deadline(&self, deadline: Instant, slot: Arc<WakeSlot>) {
        if self.timer.register(deadline, slot) {
            self.idle.notify_one();
        }
    }

    /// Admits a buffer into the ring, blocking while the ring is full.
    /// Fails (without blocking further) once the pool is closing.
    fn admit(&self, buf: Arc<BufCore>) -> bool {
        let mut guard = self.ring.lock();
        loop {
            if self.state.load(Ordering::Acquire) != OPEN {
                return false;
            }
            if self.in_flight.load(Ordering::SeqCst) < self.cmd_buf_capacity {
                break;
            }
            self.not_full.wait(&mut guard);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        self.push_pending(buf);
        true
    }

    /// One admitted buffer fully drained.
    pub(crate) fn buffer_completed(&self) {
        let drained_now = {
            let _guard = self.ring.lock();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.not_full.signal();
            self.state.load(Ordering::Acquire) == JOINING
                && self.in_flight.load(Ordering::SeqCst) == 0
        };
        if drained_now {
            self.mark_drained();
        }
    }

    fn mark_drained(&self) {
        tracing::debug!("pool drained");
        self.state.store(DRAINED, Ordering::Release);
        // Safety: the state word is owned by this pool.
        unsafe {
            let _ = futex::wake(
                core::ptr::from_ref(&self.state).cast(),
                usize::MAX,
                Filter::ALL,
            );
        }
        self.idle.notify_all();
    }

    fn join_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN
    }
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.locals.len())
            .field("idle", &self.idle.num_idle())
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A fixed set of workers with admission queues and a shared stack arena.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Builds a pool and starts its worker threads.
    pub fn new(config: PoolConfig) -> io::Result<Pool> {
        fn or_default(value: usize, default: usize) -> usize {
            if value == 0 { default } else { value }
        }

        let workers = or_default(
            config.worker_count,
            std::thread::available_parallelism().map_or(4, NonZeroUsize::get),
        );
        let cmd_buf_capacity = or_default(config.cmd_buf_capacity, DEFAULT_CMD_BUF_CAPACITY);
        let max_load_factor = or_default(config.max_load_factor, DEFAULT_MAX_LOAD_FACTOR);
        let stack_size = or_default(config.stack_size, DEFAULT_STACK_SIZE);
        let cache_len = if config.disable_stack_cache {
            0
        } else {
            or_default(config.worker_stack_cache_len, DEFAULT_STACK_CACHE_LEN)
        };

        let inner = Arc::new(PoolInner {
            state: AtomicU32::new(OPEN),
            locals: (0..workers).map(|_| RunQueue::new()).collect(),
            injector: RunQueue::new(),
            pending: SpinMutex::new(VecDeque::new()),
            capacity_waiters: SpinMutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            max_live: workers * max_load_factor,
            arena: StackArena::new(stack_size, !config.disable_stack_guard, workers * cache_len),
            timer: Timer::new(),
            idle: IdleSet::new(workers),
            ring: Mutex::new(),
            not_full: Condition::new(),
            in_flight: AtomicUsize::new(0),
            cmd_buf_capacity,
            threads: SpinMutex::new(Vec::with_capacity(workers)),
        });

        for index in 0..workers {
            let id = WorkerId::from_index(index);
            let worker_inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("strand-worker-{index}"))
                .spawn(move || worker_main(worker_inner, id))?;
            inner.threads.lock().push(handle);
        }

        Ok(Pool { inner })
    }

    /// The process-wide default pool, built with default configuration on
    /// first use.
    pub fn global() -> &'static Pool {
        static GLOBAL: OnceLock<Pool> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Pool::new(PoolConfig::default()).expect("failed to start the global pool")
        })
    }

    /// The pool whose worker is executing the caller, if any.
    pub fn current() -> Option<Pool> {
        CURRENT_WORKER.with(|cell| {
            cell.borrow()
                .as_ref()
                .map(|(_, inner)| Pool { inner: inner.clone() })
        })
    }

    pub fn worker_count(&self) -> usize {
        self.inner.locals.len()
    }

    /// The ids of this pool's workers, usable with
    /// [`CommandBufferBuilder::select_worker`](crate::cmd::CommandBufferBuilder::select_worker).
    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> + use<> {
        (0..self.worker_count()).map(WorkerId::from_index)
    }

    /// Submits a buffer, blocking while the admission ring is full. The
    /// returned handle joins to `Cancelled` if the pool is already closing.
    pub fn enqueue(&self, buffer: CommandBuffer) -> CommandBufferHandle {
        let core = BufCore::new(buffer, self.inner.clone(), 2);
        let handle = CommandBufferHandle::new(core.clone());
        if !self.inner.admit(core.clone()) {
            tracing::debug!("pool is closing, rejecting command buffer");
            core.complete_rejected();
        }
        handle
    }

    /// Like [`enqueue`](Pool::enqueue) but without a handle; completion is
    /// only observable through the buffer's own effects (or its deinit).
    pub fn enqueue_detached(&self, buffer: CommandBuffer) {
        let core = BufCore::new(buffer, self.inner.clone(), 1);
        if !self.inner.admit(core.clone()) {
            tracing::debug!("pool is closing, rejecting detached command buffer");
            core.complete_rejected();
        }
    }

    /// Whether a join has been requested; new submissions are rejected from
    /// that point on.
    pub fn join_requested(&self) -> bool {
        self.inner.join_requested()
    }

    /// Requests closure and blocks until every admitted buffer has drained
    /// and all workers have exited.
    ///
    /// Must not be called from a task of this same pool.
    pub fn join(&self) {
        debug_assert!(
            !Pool::current().is_some_and(|p| Arc::ptr_eq(&p.inner, &self.inner)),
            "a pool cannot join itself from one of its own tasks"
        );

        let inner = &self.inner;
        let _ = inner
            .state
            .compare_exchange(OPEN, JOINING, Ordering::AcqRel, Ordering::Acquire);

        let drained_now = {
            let _guard = inner.ring.lock();
            inner.in_flight.load(Ordering::SeqCst) == 0
                && inner.state.load(Ordering::Acquire) == JOINING
        };
        if drained_now {
            inner.mark_drained();
        }
        // Submitters blocked on a full ring must observe the closure.
        inner.not_full.broadcast();

        loop {
            match inner.state.load(Ordering::Acquire) {
                DRAINED => break,
                current => {
                    // Safety: the state word is owned by the pool, which we
                    // keep alive.
                    let _ = unsafe {
                        futex::wait(
                            core::ptr::from_ref(&inner.state).cast(),
                            Width::U32,
                            u64::from(current),
                            0,
                            None,
                        )
                    };
                }
            }
        }

        let threads: Vec<_> = inner.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

fn worker_main(inner: Arc<PoolInner>, id: WorkerId) {
    let _span = tracing::debug_span!("worker", id = id.index()).entered();
    tracing::debug!("worker online");

    inner.idle.register(id, std::thread::current());
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = Some((id, inner.clone())));

    let local = &inner.locals[id.index()];

    loop {
        if inner.state.load(Ordering::Acquire) == DRAINED {
            break;
        }

        // Expire due deadlines before picking work, so sleepers are not
        // starved by a busy ready queue.
        let (_, next_deadline) = inner.timer.turn(Instant::now());

        if let Some(task) = local.pop() {
            run_task(&inner, local, task);
            continue;
        }

        if let Some(task) = inner.injector.pop() {
            run_task(&inner, local, task);
            continue;
        }

        let buf = inner.pending.lock().pop_front();
        if let Some(buf) = buf {
            buf.drive();
            continue;
        }

        inner.idle.park(id, next_deadline, || {
            !local.is_empty()
                || !inner.injector.is_empty()
                || !inner.pending.lock().is_empty()
                || inner.state.load(Ordering::Acquire) == DRAINED
        });
    }

    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = None);
    tracing::debug!("worker offline");
}

/// Resumes one task and handles whatever it switched out with.
fn run_task(inner: &Arc<PoolInner>, local: &RunQueue, task: TaskRef) {
    task.set_running();

    let prev = task::install_current(Some(NonNull::from(&*task)));
    // Safety: we dequeued the task, making us its executing worker.
    let coro = unsafe { task.coro_mut() }
        .as_mut()
        .expect("ready task without a coroutine");
    let result = coro.resume(());
    task::install_current(prev);

    match result {
        CoroResult::Yielded(SwitchReason::Yielded) => {
            task.set_ready();
            local.push(task);
        }
        CoroResult::Yielded(SwitchReason::Parked) => {
            if !task.commit_park() {
                // A wake raced the switch; the task never really slept.
                local.push(task);
            }
            // Otherwise the wake slot now owns the task reference chain.
        }
        CoroResult::Returned(exit) => finalize_task(inner, task, exit),
    }
}

/// Reclaims a finished task's stack and reports to its buffer.
fn finalize_task(inner: &Arc<PoolInner>, task: TaskRef, exit: Exit) {
    tracing::trace!(id = %task.id(), ?exit, "task finished");

    // Safety: the task has exited; we are finalizing it exclusively.
    let coro = unsafe { task.coro_mut() }
        .take()
        .expect("finished task without a coroutine");
    inner.arena.release(coro.into_stack());

    inner.release_live_slot();

    if let Some(buf) = task.buf() {
        buf.task_finished(task.cmd_index(), exit == Exit::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_roundtrip() {
        let id = WorkerId::from_index(3);
        assert_eq!(id.index(), 3);
        assert_eq!(id.to_string(), "w3");
    }

    #[test]
    fn config_defaults_resolve_to_nonzero() {
        let pool = Pool::new(PoolConfig {
            worker_count: 2,
            ..PoolConfig::default()
        })
        .unwrap();
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.worker_ids().count(), 2);
        assert!(!pool.join_requested());
        pool.join();
        assert!(pool.join_requested());
    }
}
