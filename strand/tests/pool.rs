//! End-to-end scenarios for the worker pool and command buffers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use strand::sync::{Condition, Mutex};
use strand::{
    CommandBuffer, CompletionStatus, Instant, Pool, PoolConfig, Task, cancel_requested, sleep,
    worker_id, yield_now,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn trace() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .with_test_writer()
        .set_default()
}

fn small_pool(workers: usize) -> Pool {
    Pool::new(PoolConfig {
        worker_count: workers,
        stack_size: 64 * 1024,
        ..PoolConfig::default()
    })
    .expect("failed to start pool")
}

#[test]
fn single_task_completes() {
    let _trace = trace();

    static RAN: AtomicBool = AtomicBool::new(false);

    let handle = Pool::global().enqueue(CommandBuffer::single(Task::new(|_| {
        RAN.store(true, Ordering::Release);
    })));

    assert_eq!(handle.join(), CompletionStatus::Completed);
    assert!(RAN.load(Ordering::Acquire));
}

#[test]
fn producer_consumer_bounded() {
    let _trace = trace();

    const ITEMS: u32 = 1000;
    const CAP: usize = 4;

    struct Chan {
        mu: Mutex,
        not_full: Condition,
        not_empty: Condition,
        queue: std::cell::UnsafeCell<VecDeque<u32>>,
    }
    // Safety: `queue` is only touched while `mu` is held.
    unsafe impl Sync for Chan {}

    let chan = Arc::new(Chan {
        mu: Mutex::new(),
        not_full: Condition::new(),
        not_empty: Condition::new(),
        queue: std::cell::UnsafeCell::new(VecDeque::new()),
    });
    let received = Arc::new(std::sync::Mutex::new(Vec::new()));

    let producer = {
        let chan = chan.clone();
        Task::builder().label("producer").build(move |_| {
            for item in 0..ITEMS {
                let mut guard = chan.mu.lock();
                // Safety: guarded by `mu`.
                while unsafe { (*chan.queue.get()).len() } >= CAP {
                    chan.not_full.wait(&mut guard);
                }
                // Safety: guarded by `mu`.
                unsafe { (*chan.queue.get()).push_back(item) };
                drop(guard);
                chan.not_empty.signal();
            }
        })
    };

    let consumer = {
        let chan = chan.clone();
        let received = received.clone();
        Task::builder().label("consumer").build(move |_| {
            for _ in 0..ITEMS {
                let mut guard = chan.mu.lock();
                // Safety: guarded by `mu`.
                let item = loop {
                    match unsafe { (*chan.queue.get()).pop_front() } {
                        Some(item) => break item,
                        None => chan.not_empty.wait(&mut guard),
                    }
                };
                drop(guard);
                chan.not_full.signal();
                received.lock().unwrap().push(item);
            }
        })
    };

    let pool = small_pool(2);
    let handle = pool.enqueue(
        CommandBuffer::builder()
            .label("producer-consumer")
            .enqueue(producer)
            .enqueue(consumer)
            .build(),
    );

    assert_eq!(handle.join(), CompletionStatus::Completed);
    let received = received.lock().unwrap();
    assert_eq!(received.len(), ITEMS as usize);
    assert!(received.windows(2).all(|w| w[0] < w[1]), "items out of order");
    pool.join();
}

#[test]
fn batch_runs_every_index() {
    let _trace = trace();

    let indices = Arc::new(std::sync::Mutex::new(Vec::new()));
    let task = {
        let indices = indices.clone();
        Task::builder()
            .batch(5)
            .build(move |i| indices.lock().unwrap().push(i))
    };

    let pool = small_pool(2);
    assert_eq!(
        pool.enqueue(CommandBuffer::single(task)).join(),
        CompletionStatus::Completed
    );
    // Batch indices run in order on one coroutine.
    assert_eq!(*indices.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    pool.join();
}

#[test]
fn worker_pinning() {
    let _trace = trace();

    let pool = small_pool(3);
    let target = pool.worker_ids().nth(1).unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut buf = CommandBuffer::builder().select_worker(target);
    for _ in 0..8 {
        let seen = seen.clone();
        buf = buf.enqueue(Task::new(move |_| {
            seen.lock().unwrap().push(worker_id().unwrap());
            yield_now();
            seen.lock().unwrap().push(worker_id().unwrap());
        }));
    }

    assert_eq!(pool.enqueue(buf.build()).join(), CompletionStatus::Completed);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 16);
    assert!(seen.iter().all(|&w| w == target), "task ran off its pinned worker");
    pool.join();
}

#[test]
fn barrier_waits_for_prior_tasks() {
    let _trace = trace();

    static FIRST_DONE: AtomicUsize = AtomicUsize::new(0);
    static ORDER_OK: AtomicBool = AtomicBool::new(true);

    let slow = |_: usize| {
        sleep(Duration::from_millis(10));
        FIRST_DONE.fetch_add(1, Ordering::SeqCst);
    };
    let after = |_: usize| {
        if FIRST_DONE.load(Ordering::SeqCst) != 2 {
            ORDER_OK.store(false, Ordering::SeqCst);
        }
    };

    let pool = small_pool(2);
    let handle = pool.enqueue(
        CommandBuffer::builder()
            .enqueue(Task::new(slow))
            .enqueue(Task::new(slow))
            .barrier()
            .enqueue(Task::new(after))
            .build(),
    );

    assert_eq!(handle.join(), CompletionStatus::Completed);
    assert!(ORDER_OK.load(Ordering::SeqCst), "barrier let a task run early");
    pool.join();
}

#[test]
fn wait_indirect_points_backwards() {
    let _trace = trace();

    static DONE: AtomicBool = AtomicBool::new(false);

    let pool = small_pool(2);
    // [enqueue][wait-indirect 1]: the wait completes when the task does.
    let handle = pool.enqueue(
        CommandBuffer::builder()
            .enqueue(Task::new(|_| {
                sleep(Duration::from_millis(5));
                DONE.store(true, Ordering::SeqCst);
            }))
            .wait_indirect(1)
            .build(),
    );

    assert_eq!(handle.join(), CompletionStatus::Completed);
    assert!(DONE.load(Ordering::SeqCst));
    pool.join();
}

#[test]
fn cancellation_is_observed() {
    let _trace = trace();

    static OBSERVED: AtomicBool = AtomicBool::new(false);

    let pool = small_pool(2);
    let handle = pool.enqueue(CommandBuffer::single(Task::new(|_| {
        while !cancel_requested() {
            yield_now();
        }
        OBSERVED.store(true, Ordering::SeqCst);
    })));

    // Give the task a moment to start spinning, then cancel.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(handle.cancel(), CompletionStatus::Cancelled);
    assert!(OBSERVED.load(Ordering::SeqCst));
    pool.join();
}

#[test]
fn abort_cancels_the_buffer() {
    let _trace = trace();

    static AFTER_ABORT: AtomicBool = AtomicBool::new(false);
    static SIBLING_RAN: AtomicBool = AtomicBool::new(false);

    let pool = small_pool(2);
    let handle = pool.enqueue(
        CommandBuffer::builder()
            .enqueue(Task::new(|_| {
                if std::hint::black_box(true) {
                    strand::abort();
                }
                AFTER_ABORT.store(true, Ordering::SeqCst);
            }))
            .enqueue(Task::new(|_| SIBLING_RAN.store(true, Ordering::SeqCst)))
            .build(),
    );

    assert_eq!(handle.join(), CompletionStatus::Cancelled);
    assert!(!AFTER_ABORT.load(Ordering::SeqCst));
    assert!(SIBLING_RAN.load(Ordering::SeqCst));
    pool.join();
}

#[test]
fn panic_is_treated_as_abort() {
    let _trace = trace();

    let pool = small_pool(2);
    let handle = pool.enqueue(CommandBuffer::single(Task::new(|_| {
        panic!("worker goes boom");
    })));
    assert_eq!(handle.join(), CompletionStatus::Cancelled);

    // The pool survives and keeps executing.
    let handle = pool.enqueue(CommandBuffer::single(Task::new(|_| {})));
    assert_eq!(handle.join(), CompletionStatus::Completed);
    pool.join();
}

#[test]
fn admission_backpressure_blocks_third_buffer() {
    let _trace = trace();

    static RELEASE_1: AtomicBool = AtomicBool::new(false);
    static RELEASE_2: AtomicBool = AtomicBool::new(false);
    static THIRD_ADMITTED: AtomicBool = AtomicBool::new(false);

    fn spin_until(flag: &'static AtomicBool) -> impl Fn(usize) + Send + 'static {
        move |_| {
            while !flag.load(Ordering::Acquire) {
                yield_now();
            }
        }
    }

    let pool = Pool::new(PoolConfig {
        worker_count: 2,
        cmd_buf_capacity: 2,
        stack_size: 64 * 1024,
        ..PoolConfig::default()
    })
    .unwrap();

    let h1 = pool.enqueue(CommandBuffer::single(Task::new(spin_until(&RELEASE_1))));
    let h2 = pool.enqueue(CommandBuffer::single(Task::new(spin_until(&RELEASE_2))));

    let submitter = {
        let pool = pool.clone();
        std::thread::spawn(move || {
            let handle = pool.enqueue(CommandBuffer::single(Task::new(|_| {})));
            THIRD_ADMITTED.store(true, Ordering::SeqCst);
            handle.join()
        })
    };

    // The ring is full; the third enqueue must still be blocked.
    std::thread::sleep(Duration::from_millis(100));
    assert!(
        !THIRD_ADMITTED.load(Ordering::SeqCst),
        "third buffer was admitted past the ring capacity"
    );

    // Completing the first buffer frees a slot.
    RELEASE_1.store(true, Ordering::Release);
    assert_eq!(h1.join(), CompletionStatus::Completed);
    assert_eq!(submitter.join().unwrap(), CompletionStatus::Completed);
    assert!(THIRD_ADMITTED.load(Ordering::SeqCst));

    RELEASE_2.store(true, Ordering::Release);
    assert_eq!(h2.join(), CompletionStatus::Completed);
    pool.join();
}

#[test]
fn serial_buffers_reuse_cached_stacks() {
    let _trace = trace();

    const RUNS: usize = 1000;

    let pool = Pool::new(PoolConfig {
        worker_count: 2,
        worker_stack_cache_len: 1,
        disable_stack_guard: true,
        stack_size: 64 * 1024,
        ..PoolConfig::default()
    })
    .unwrap();

    let markers = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
    for _ in 0..RUNS {
        let markers = markers.clone();
        let handle = pool.enqueue(CommandBuffer::single(Task::new(move |_| {
            // The address of a local identifies the stack this run used.
            let probe = 0u8;
            markers
                .lock()
                .unwrap()
                .insert(core::ptr::from_ref(&probe) as usize);
        })));
        assert_eq!(handle.join(), CompletionStatus::Completed);
    }

    let distinct = markers.lock().unwrap().len();
    assert!(
        distinct <= pool.worker_count(),
        "expected at most {} distinct stacks, saw {distinct}",
        pool.worker_count()
    );
    pool.join();
}

#[test]
fn running_tasks_never_exceed_worker_count() {
    let _trace = trace();

    const WORKERS: usize = 2;
    static ON_CPU: AtomicUsize = AtomicUsize::new(0);
    static MAX_ON_CPU: AtomicUsize = AtomicUsize::new(0);

    let pool = small_pool(WORKERS);
    let mut buf = CommandBuffer::builder();
    for _ in 0..8 {
        buf = buf.enqueue(Task::new(|_| {
            for _ in 0..50 {
                let current = ON_CPU.fetch_add(1, Ordering::SeqCst) + 1;
                MAX_ON_CPU.fetch_max(current, Ordering::SeqCst);
                ON_CPU.fetch_sub(1, Ordering::SeqCst);
                yield_now();
            }
        }));
    }

    assert_eq!(pool.enqueue(buf.build()).join(), CompletionStatus::Completed);
    assert!(MAX_ON_CPU.load(Ordering::SeqCst) <= WORKERS);
    pool.join();
}

#[test]
fn live_tasks_respect_the_load_factor() {
    let _trace = trace();

    static ALIVE: AtomicUsize = AtomicUsize::new(0);
    static MAX_ALIVE: AtomicUsize = AtomicUsize::new(0);

    // 2 workers x factor 2 => at most 4 concurrently live tasks.
    let pool = Pool::new(PoolConfig {
        worker_count: 2,
        max_load_factor: 2,
        stack_size: 64 * 1024,
        ..PoolConfig::default()
    })
    .unwrap();

    let mut buf = CommandBuffer::builder();
    for _ in 0..12 {
        buf = buf.enqueue(Task::new(|_| {
            let current = ALIVE.fetch_add(1, Ordering::SeqCst) + 1;
            MAX_ALIVE.fetch_max(current, Ordering::SeqCst);
            sleep(Duration::from_millis(10));
            ALIVE.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    assert_eq!(pool.enqueue(buf.build()).join(), CompletionStatus::Completed);
    let max = MAX_ALIVE.load(Ordering::SeqCst);
    assert!(max <= 4, "live-task cap exceeded: {max}");
    pool.join();
}

#[test]
fn tls_destructors_run_once_per_value() {
    let _trace = trace();

    use strand::tls;

    static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
    static KEY_A: u8 = 0;
    static KEY_B: u8 = 0;
    static KEY_C: u8 = 0;

    fn count(_value: *mut ()) {
        DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn chain(_value: *mut ()) {
        DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
        // Re-registering from inside a destructor gets another sweep pass.
        tls::set(tls::TssKey::from(&KEY_C), 9 as *mut (), Some(count)).unwrap();
    }

    let pool = small_pool(1);
    let handle = pool.enqueue(CommandBuffer::single(Task::new(|_| {
        let a = tls::TssKey::from(&KEY_A);
        let b = tls::TssKey::from(&KEY_B);

        tls::set(a, 1 as *mut (), Some(count)).unwrap();
        // Replacement must not run the old destructor.
        tls::set(a, 2 as *mut (), Some(count)).unwrap();
        assert_eq!(tls::get(a).unwrap(), 2 as *mut ());

        tls::set(b, 3 as *mut (), Some(chain)).unwrap();

        // Explicit clear runs the destructor right away.
        tls::clear(a).unwrap();
        assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), 1);
        assert!(tls::get(a).unwrap().is_null());
    })));

    assert_eq!(handle.join(), CompletionStatus::Completed);
    // clear(a) + exit sweep of b + chained c.
    assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), 3);
    pool.join();
}

#[test]
fn deinit_runs_once_after_drain_and_handles() {
    let _trace = trace();

    static DEINITS: AtomicUsize = AtomicUsize::new(0);

    let pool = small_pool(2);
    let handle = pool.enqueue(
        CommandBuffer::builder()
            .enqueue(Task::new(|_| {}))
            .deinit(|| {
                DEINITS.fetch_add(1, Ordering::SeqCst);
            })
            .build(),
    );

    assert_eq!(handle.join(), CompletionStatus::Completed);
    assert_eq!(DEINITS.load(Ordering::SeqCst), 1);

    // Detached buffers deinit on their own once drained.
    pool.enqueue_detached(
        CommandBuffer::builder()
            .enqueue(Task::new(|_| {}))
            .deinit(|| {
                DEINITS.fetch_add(1, Ordering::SeqCst);
            })
            .build(),
    );
    while DEINITS.load(Ordering::SeqCst) < 2 {
        std::thread::yield_now();
    }
    pool.join();
}

#[test]
fn enqueue_after_join_is_cancelled_not_dropped() {
    let _trace = trace();

    static RAN: AtomicBool = AtomicBool::new(false);
    static DEINITS: AtomicUsize = AtomicUsize::new(0);

    let pool = small_pool(2);
    pool.join();
    assert!(pool.join_requested());

    let handle = pool.enqueue(
        CommandBuffer::builder()
            .enqueue(Task::new(|_| RAN.store(true, Ordering::SeqCst)))
            .deinit(|| {
                DEINITS.fetch_add(1, Ordering::SeqCst);
            })
            .build(),
    );
    assert_eq!(handle.join(), CompletionStatus::Cancelled);
    assert!(!RAN.load(Ordering::SeqCst));
    // Rejected buffers still deinit; nothing is silently dropped.
    assert_eq!(DEINITS.load(Ordering::SeqCst), 1);
}

#[test]
fn sleep_does_not_wake_early() {
    let _trace = trace();

    static ELAPSED_NANOS: AtomicUsize = AtomicUsize::new(0);

    let pool = small_pool(2);
    let handle = pool.enqueue(CommandBuffer::single(Task::new(|_| {
        let start = Instant::now();
        sleep(Duration::from_millis(50));
        let elapsed = Instant::now().saturating_duration_since(start);
        ELAPSED_NANOS.store(elapsed.as_nanos() as usize, Ordering::SeqCst);
    })));

    assert_eq!(handle.join(), CompletionStatus::Completed);
    let elapsed = Duration::from_nanos(ELAPSED_NANOS.load(Ordering::SeqCst) as u64);
    assert!(elapsed >= Duration::from_millis(50), "woke after {elapsed:?}");
    pool.join();
}

#[test]
fn tasks_can_submit_and_join_buffers() {
    let _trace = trace();

    static INNER_RAN: AtomicBool = AtomicBool::new(false);

    let pool = small_pool(2);
    let outer_pool = pool.clone();
    let handle = pool.enqueue(CommandBuffer::single(Task::new(move |_| {
        let inner = outer_pool.enqueue(CommandBuffer::single(Task::new(|_| {
            INNER_RAN.store(true, Ordering::SeqCst);
        })));
        // Joining from inside a task parks the task, not the worker.
        assert_eq!(inner.join(), CompletionStatus::Completed);
    })));

    assert_eq!(handle.join(), CompletionStatus::Completed);
    assert!(INNER_RAN.load(Ordering::SeqCst));
    pool.join();
}
