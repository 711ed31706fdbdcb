//! Architecture-specific context switching.
//!
//! Each backend provides the same small surface:
//!
//! - `STACK_ALIGNMENT`: required alignment of stack pointer values.
//! - `init_stack`: lay out a fresh coroutine stack so the first switch into
//!   it enters the given entry function.
//! - `switch_and_link`: resume a coroutine, storing a link back to the
//!   caller's stack at the base of the coroutine stack.
//! - `switch_yield`: suspend the current coroutine through that link.
//! - `switch_and_reset`: leave the coroutine for good, reporting a null stack
//!   pointer to the resumer.
//!
//! Only x86-64 (SysV) and aarch64 are supported; other targets fail to build.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("no context-switch backend for this target");
    }
}

/// Pushes a word onto a downward-growing stack, `None` leaving the slot
/// uninitialized.
#[inline]
pub(crate) unsafe fn push(sp: &mut usize, val: Option<usize>) {
    // Safety: ensured by caller
    unsafe {
        *sp -= size_of::<usize>();
        if let Some(val) = val {
            *(*sp as *mut usize) = val;
        }
    }
}

/// Writes `obj` onto the stack with correct alignment for both the object and
/// the final stack pointer. `sp_offset` is the number of bytes the backend
/// will push below the object before the first switch.
#[inline]
pub(crate) unsafe fn write_obj_on_stack<T>(sp: &mut usize, sp_offset: usize, obj: T) {
    // Transfers go through registers or a pointer; anything bigger than this
    // on a fresh stack is a bug in the caller.
    assert!(size_of::<T>() <= 1024, "initial object too large");

    // Safety: ensured by caller
    unsafe {
        if align_of::<T>() > STACK_ALIGNMENT {
            *sp -= size_of::<T>();
            *sp &= !(align_of::<T>() - 1);
        } else {
            // `sp + sp_offset` is aligned; pad so that after the backend's
            // remaining pushes the stack pointer lands aligned again.
            let total = sp_offset + size_of::<T>();
            let rem = total % STACK_ALIGNMENT;
            if rem != 0 {
                *sp -= STACK_ALIGNMENT - rem;
            }
            *sp -= size_of::<T>();
        }
        (*sp as *mut T).write(obj);

        debug_assert_eq!(*sp % STACK_ALIGNMENT, 0);
    }
}
