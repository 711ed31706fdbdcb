//! Ready queues.
//!
//! Intrusive MPSC queues of task references: any context may push (wakes,
//! dispatch), while popping goes through the queue's single-consumer handle —
//! exclusive to the owning worker for local queues, opportunistic for the
//! shared injector, where a busy consumer just means another worker is
//! already draining it. The queue needs a stub node of its element type; a
//! never-executed stub task serves.

use core::sync::atomic::{AtomicUsize, Ordering};

use cordyceps::MpscQueue;

use crate::task::{TaskCore, TaskRef};

pub(crate) struct RunQueue {
    queue: MpscQueue<TaskCore>,
    len: AtomicUsize,
}

impl RunQueue {
    pub(crate) fn new() -> RunQueue {
        RunQueue {
            queue: MpscQueue::new_with_stub(TaskCore::new_stub()),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, task: TaskRef) {
        self.len.fetch_add(1, Ordering::SeqCst);
        self.queue.enqueue(task);
    }

    /// Pops the next task, unless another consumer currently holds the
    /// queue (shared-queue case), in which case the caller just moves on.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        let consumer = self.queue.try_consume()?;
        let task = consumer.dequeue()?;
        self.len.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len.load(Ordering::SeqCst) == 0
    }
}
