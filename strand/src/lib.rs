//! An M:N cooperative task runtime.
//!
//! User work items ([`Task`]s) run as stackful coroutines on a fixed pool of
//! worker threads ([`Pool`]). Tasks are submitted in batches through
//! immutable [command buffers](cmd), which also express ordering (barriers,
//! indirect waits) and worker pinning. Blocking — [`sync::Mutex`],
//! [`sync::Condition`], the raw [`futex`] surface, [`sleep`] — is built on a
//! single process-wide [parking lot](park) that suspends tasks and foreign
//! threads alike.
//!
//! ```no_run
//! use strand::{CommandBuffer, Pool, Task};
//!
//! let pool = Pool::global();
//! let handle = pool.enqueue(CommandBuffer::single(Task::new(|_| {
//!     println!("hello from a task");
//! })));
//! handle.join();
//! ```

pub mod cmd;
pub mod error;
pub mod exec;
pub mod futex;
pub mod park;
pub mod sync;
pub mod task;
pub mod time;
pub mod tls;

pub use cmd::{
    Command, CommandBuffer, CommandBufferBuilder, CommandBufferHandle, CompletionStatus,
};
pub use error::{NotATask, WaitError};
pub use exec::{Pool, PoolConfig, WorkerId};
pub use task::{
    Task, TaskBuilder, TaskId, abort, cancel_requested, sleep, task_id, worker_id, yield_now,
};
pub use time::Instant;
