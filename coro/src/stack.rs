//! Coroutine stack allocation.
//!
//! Stacks grow downward and are referenced by their highest usable address.
//! [`OsStack`] maps anonymous memory and, when guarding is enabled, leaves the
//! lowest page inaccessible so that a runaway stack faults instead of
//! silently corrupting adjacent memory. The guard is a detection aid only;
//! overflowing a coroutine stack is not a recoverable condition.

use std::io;
use std::ptr;

/// A stack pointer value. Never null, which lets the switching code use zero
/// as the "coroutine finished" marker.
pub type StackPointer = core::num::NonZeroUsize;

/// Minimum usable size of a coroutine stack, excluding any guard page.
pub const MIN_STACK_SIZE: usize = 4096;

pub use crate::arch::STACK_ALIGNMENT;

/// Memory usable as a coroutine stack.
///
/// # Safety
///
/// `top` and `bottom` must delimit a region that stays valid and writable
/// (guard pages excepted) for as long as any coroutine references it, and
/// both must be aligned to [`STACK_ALIGNMENT`].
pub unsafe trait Stack {
    /// Highest usable address of the stack; the first frame starts here.
    fn top(&self) -> StackPointer;

    /// Lowest address of the region, including any guard page.
    fn bottom(&self) -> StackPointer;
}

// Safety: forwards to the pointee.
unsafe impl<S: Stack> Stack for &'_ mut S {
    #[inline]
    fn top(&self) -> StackPointer {
        (**self).top()
    }

    #[inline]
    fn bottom(&self) -> StackPointer {
        (**self).bottom()
    }
}

/// A stack backed by an anonymous memory mapping.
pub struct OsStack {
    top: StackPointer,
    map_len: usize,
    guard_len: usize,
}

// Safety: the mapping is plain memory, not tied to the creating thread.
unsafe impl Send for OsStack {}

impl OsStack {
    /// Maps a stack with at least `size` usable bytes.
    ///
    /// `size` is rounded up to the page size. With `guarded` set, one extra
    /// inaccessible page is kept below the usable region.
    pub fn new(size: usize, guarded: bool) -> io::Result<Self> {
        let page_size = page_size();
        let size = size.max(MIN_STACK_SIZE);

        let guard_len = if guarded { page_size } else { 0 };
        let map_len = size
            .checked_add(guard_len + page_size - 1)
            .expect("stack size overflow")
            & !(page_size - 1);

        // Safety: fresh anonymous mapping, error-checked below.
        unsafe {
            // Reserve the whole region inaccessible first, then open up
            // everything above the guard.
            let map = libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // Construct the handle before mprotect so the mapping is unmapped
            // again if making it accessible fails.
            let out = Self {
                top: StackPointer::new(map as usize + map_len).unwrap(),
                map_len,
                guard_len,
            };

            if libc::mprotect(
                map.cast::<u8>().add(guard_len).cast(),
                map_len - guard_len,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Usable bytes of this stack, excluding any guard page.
    pub fn len(&self) -> usize {
        self.map_len - self.guard_len
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Drop for OsStack {
    fn drop(&mut self) {
        let map = self.top.get() - self.map_len;
        // Safety: `map..map + map_len` is exactly the region mapped in `new`.
        let ret = unsafe { libc::munmap(map as *mut _, self.map_len) };
        debug_assert_eq!(ret, 0);
    }
}

// Safety: `top`/`bottom` delimit the mapping created in `OsStack::new`, which
// lives until the `OsStack` is dropped, and mmap returns page-aligned memory.
unsafe impl Stack for OsStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.map_len).unwrap()
    }
}

pub(crate) fn page_size() -> usize {
    // Safety: sysconf is always safe to call.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(page_size.is_power_of_two());
    page_size
}
