//! Blocking primitives built on the runtime's futex.
//!
//! These work from tasks *and* from foreign threads: the parking lot
//! underneath suspends whichever kind of context is calling.

mod condition;
mod mutex;

pub use condition::Condition;
pub use mutex::{Mutex, MutexGuard};
