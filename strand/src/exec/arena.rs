//! Coroutine stack cache.
//!
//! Every stack in a pool has the same (configured) size, so the cache is a
//! plain LIFO free list: `release` keeps up to `cache_cap` stacks warm,
//! `acquire` pops the most recently returned one. The cap is
//! `workers · worker_stack_cache_len`, zero when the cache is disabled.

use std::io;

use coro::stack::OsStack;
use spin::Mutex;

pub(crate) struct StackArena {
    stack_size: usize,
    guarded: bool,
    cache_cap: usize,
    cache: Mutex<Vec<OsStack>>,
}

impl StackArena {
    pub(crate) fn new(stack_size: usize, guarded: bool, cache_cap: usize) -> StackArena {
        StackArena {
            stack_size,
            guarded,
            cache_cap,
            cache: Mutex::new(Vec::with_capacity(cache_cap)),
        }
    }

    /// Pops a cached stack or maps a fresh one.
    pub(crate) fn acquire(&self) -> io::Result<OsStack> {
        if let Some(stack) = self.cache.lock().pop() {
            return Ok(stack);
        }
        OsStack::new(self.stack_size, self.guarded)
    }

    /// Returns a stack to the cache, unmapping it if the cache is full.
    pub(crate) fn release(&self, stack: OsStack) {
        let mut cache = self.cache.lock();
        if cache.len() < self.cache_cap {
            cache.push(stack);
        }
        // Dropping past the cap unmaps the stack.
    }
}
