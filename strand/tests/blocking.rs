//! End-to-end scenarios for the futex surface and the parking lot.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use strand::futex::{self, Cmp, Filter, Width};
use strand::park::{self, FilterOp};
use strand::time::{Instant, deadline_after};
use strand::{CommandBuffer, CompletionStatus, Pool, PoolConfig, Task};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn trace() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .with_test_writer()
        .set_default()
}

/// Number of waiters currently queued on `key`, observed without waking
/// anyone.
fn queued_on(key: usize) -> usize {
    let mut count = 0;
    park::unpark_filter(
        key,
        |_| {
            count += 1;
            FilterOp::Skip
        },
        |_| 0,
    );
    count
}

#[test]
fn requeue_storm() {
    let _trace = trace();

    const WAITERS: usize = 128;

    static FROM: AtomicU8 = AtomicU8::new(0xAB);
    static TO: AtomicU8 = AtomicU8::new(0);
    static WOKEN: AtomicUsize = AtomicUsize::new(0);

    // Enough headroom to keep all 128 waiters live at once.
    let pool = Pool::new(PoolConfig {
        worker_count: 4,
        max_load_factor: 32,
        stack_size: 64 * 1024,
        ..PoolConfig::default()
    })
    .unwrap();

    let mut buf = CommandBuffer::builder().label("requeue-storm");
    for token in 0..WAITERS {
        buf = buf.enqueue(Task::new(move |_| {
            // Safety: FROM is static and u8-aligned.
            let result = unsafe {
                futex::wait(
                    core::ptr::from_ref(&FROM).cast(),
                    Width::U8,
                    0xAB,
                    token,
                    None,
                )
            };
            assert!(result.is_ok());
            WOKEN.fetch_add(1, Ordering::SeqCst);
        }));
    }
    let handle = pool.enqueue(buf.build());

    let from_key = core::ptr::from_ref(&FROM) as usize;
    let to_key = core::ptr::from_ref(&TO) as usize;

    // Wait until all 128 are actually parked.
    while queued_on(from_key) < WAITERS {
        std::thread::yield_now();
    }

    // Wake one, move the remaining 127 onto TO.
    // Safety: both words are static and u8-aligned.
    let result = unsafe {
        futex::requeue(
            core::ptr::from_ref(&FROM).cast(),
            core::ptr::from_ref(&TO).cast(),
            Width::U8,
            0xAB,
            1,
            WAITERS - 1,
            Filter::ALL,
        )
    }
    .unwrap();
    assert_eq!(result.unparked, 1);
    assert_eq!(result.requeued, WAITERS - 1);
    assert!(!result.has_more);

    assert_eq!(queued_on(from_key), 0);

    // Release everyone moved to TO.
    // Safety: TO is static; Filter::ALL has no derefs.
    let woken = unsafe {
        futex::wake(core::ptr::from_ref(&TO).cast(), usize::MAX, Filter::ALL)
    }
    .unwrap();
    assert_eq!(woken, WAITERS - 1);

    assert_eq!(handle.join(), CompletionStatus::Completed);
    assert_eq!(WOKEN.load(Ordering::SeqCst), WAITERS);
    assert_eq!(queued_on(to_key), 0);
    pool.join();
}

#[test]
fn wake_selects_by_token() {
    let _trace = trace();

    static WORD: AtomicU8 = AtomicU8::new(1);
    static WHO: AtomicUsize = AtomicUsize::new(0);

    let pool = Pool::new(PoolConfig {
        worker_count: 2,
        stack_size: 64 * 1024,
        ..PoolConfig::default()
    })
    .unwrap();

    let mut buf = CommandBuffer::builder();
    for token in 1..=4usize {
        buf = buf.enqueue(Task::new(move |_| {
            // Safety: WORD is static and u8-aligned.
            let result = unsafe {
                futex::wait(core::ptr::from_ref(&WORD).cast(), Width::U8, 1, token, None)
            };
            assert!(result.is_ok());
            WHO.fetch_add(token, Ordering::SeqCst);
        }));
    }
    let handle = pool.enqueue(buf.build());

    let key = core::ptr::from_ref(&WORD) as usize;
    while queued_on(key) < 4 {
        std::thread::yield_now();
    }

    // Wake exactly the waiter whose token is 2.
    // Safety: WORD is static; the filter has no derefs.
    let woken = unsafe {
        futex::wake(
            core::ptr::from_ref(&WORD).cast(),
            usize::MAX,
            Filter::token(Cmp::Eq, 2),
        )
    }
    .unwrap();
    assert_eq!(woken, 1);

    // Only token 2 has run; the other three are still parked.
    while WHO.load(Ordering::SeqCst) < 2 {
        std::thread::yield_now();
    }
    assert_eq!(WHO.load(Ordering::SeqCst), 2);
    assert_eq!(queued_on(key), 3);

    // Safety: as above.
    let woken = unsafe {
        futex::wake(core::ptr::from_ref(&WORD).cast(), usize::MAX, Filter::ALL)
    }
    .unwrap();
    assert_eq!(woken, 3);

    assert_eq!(handle.join(), CompletionStatus::Completed);
    assert_eq!(WHO.load(Ordering::SeqCst), 1 + 2 + 3 + 4);
    pool.join();
}

#[test]
fn wait_timeout_is_never_early() {
    let _trace = trace();

    static WORD: AtomicU8 = AtomicU8::new(7);

    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    // Safety: WORD is static and u8-aligned.
    let result = unsafe {
        futex::wait(
            core::ptr::from_ref(&WORD).cast(),
            Width::U8,
            7,
            0,
            Some(deadline_after(timeout)),
        )
    };
    let elapsed = Instant::now().saturating_duration_since(start);

    assert_eq!(result, Err(strand::WaitError::Timeout));
    assert!(elapsed >= timeout, "timed out after only {elapsed:?}");
}

#[test]
fn requeue_between_colliding_keys_does_not_deadlock() {
    let _trace = trace();

    // Same word as source and destination: both keys land in one bucket,
    // which the lock-ordering must tolerate.
    static WORD: AtomicU8 = AtomicU8::new(3);

    let waiter = std::thread::spawn(|| {
        // Safety: WORD is static and u8-aligned.
        unsafe { futex::wait(core::ptr::from_ref(&WORD).cast(), Width::U8, 3, 0, None) }
    });

    let key = core::ptr::from_ref(&WORD) as usize;
    while queued_on(key) < 1 {
        std::thread::yield_now();
    }

    // Requeue onto the same key: nothing wakes, the waiter just moves.
    // Safety: as above.
    let result = unsafe {
        futex::requeue(
            core::ptr::from_ref(&WORD).cast(),
            core::ptr::from_ref(&WORD).cast(),
            Width::U8,
            3,
            0,
            usize::MAX,
            Filter::ALL,
        )
    }
    .unwrap();
    assert_eq!(result.unparked, 0);
    assert_eq!(result.requeued, 1);

    // Safety: as above.
    let woken = unsafe {
        futex::wake(core::ptr::from_ref(&WORD).cast(), usize::MAX, Filter::ALL)
    }
    .unwrap();
    assert_eq!(woken, 1);
    assert!(waiter.join().unwrap().is_ok());
}

#[test]
fn wait_many_reports_the_woken_key() {
    let _trace = trace();

    static WORDS: [AtomicU8; 3] = [AtomicU8::new(0), AtomicU8::new(0), AtomicU8::new(0)];

    let waiter = std::thread::spawn(|| {
        let waits: Vec<futex::WaitKey> = WORDS
            .iter()
            .map(|w| futex::WaitKey {
                key: core::ptr::from_ref(w).cast(),
                size: Width::U8,
                expect: 0,
            })
            .collect();
        // Safety: every key is static and u8-aligned.
        unsafe { futex::wait_many(&waits, 0, None) }
    });

    let key1 = core::ptr::from_ref(&WORDS[1]) as usize;
    while queued_on(key1) < 1 {
        std::thread::yield_now();
    }

    // Safety: as above.
    let woken = unsafe {
        futex::wake(core::ptr::from_ref(&WORDS[1]).cast(), 1, Filter::ALL)
    }
    .unwrap();
    assert_eq!(woken, 1);

    let (index, _token) = waiter.join().unwrap().unwrap();
    assert_eq!(index, 1);

    // The other two keys hold no residual entries.
    for word in &WORDS {
        assert_eq!(queued_on(core::ptr::from_ref(word) as usize), 0);
    }
}

#[test]
fn mutex_handoff_under_heavy_contention() {
    let _trace = trace();

    use strand::sync::Mutex;

    // Long enough to cross several fairness windows, so the hand-off path
    // (be_fair) gets exercised alongside the plain wake path.
    const THREADS: usize = 4;
    const ITERS: usize = 20_000;

    let mutex = std::sync::Arc::new(Mutex::new());
    let counter = std::sync::Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = mutex.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..ITERS {
                    let _guard = mutex.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERS);
}
