//! x86-64 (SysV) context switching.
//!
//! Register protocol shared by all switch flavors:
//!
//! - `rdi` carries the transferred value in both directions.
//! - `rsi` carries the coroutine stack base into a switch and the suspended
//!   stack pointer (or 0 for a finished coroutine) back out.
//! - `rdx` carries the target stack pointer into a switch.
//!
//! The two words at the base of every coroutine stack are fixed: the entry
//! function address at `base - 8` and the *parent link* at `base - 16`. The
//! parent link is rewritten on every switch into the coroutine and is what
//! `switch_yield` / `switch_and_reset` use to find their way back.
//!
//! Suspended coroutine stacks store, from the stack pointer upward: the
//! resume address, then the callee-saved `rbx` and `rbp`. The parent stack
//! stores the return address pushed by `call`, then `rbp`, with `rbx` saved
//! one word above by the caller side of the switch.

use core::arch::{asm, naked_asm};

use crate::arch::{push, write_obj_on_stack};
use crate::stack::{Stack, StackPointer};
use crate::val::EncodedValue;

pub const STACK_ALIGNMENT: usize = 16;

/// Prepares `stack` so the first `switch_and_link` enters `func(arg, &mut
/// parent_link, &mut obj)`.
#[inline]
pub unsafe fn init_stack<T>(
    stack: &dyn Stack,
    func: unsafe extern "C" fn(arg: EncodedValue, parent_link: &mut StackPointer, obj: *mut T) -> !,
    obj: T,
) -> StackPointer {
    // Safety: ensured by caller
    unsafe {
        let mut sp = stack.top().get();

        // Entry function, read by the trampoline.
        push(&mut sp, Some(func as usize));

        // Parent link slot, rewritten by every switch into this stack.
        push(&mut sp, None);

        // The initial object; the trampoline recomputes its address from the
        // stack pointer, so it must stay directly above the resume slot.
        write_obj_on_stack(&mut sp, 16, obj);

        // What `switch_and_link` calls on the first resume.
        push(&mut sp, Some(stack_init_trampoline as usize));

        StackPointer::new_unchecked(sp)
    }
}

/// First-resume entry point. Reached via `call` from `switch_and_link` with
/// the parent stack still active.
///
/// On entry: `rsp` = parent stack (return address pushed), `rdx` = coroutine
/// stack pointer, `rsi` = coroutine stack base, `rdi` = transferred value.
#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        ".cfi_startproc",
        // Complete the parent frame record (return address + rbp) and
        // publish the parent stack pointer through the parent link.
        "push rbp",
        "mov [rsi - 16], rsp",
        // The entry function takes the parent link address as its second
        // argument; it doubles as the `Control` handle.
        "sub rsi, 16",
        // Move onto the coroutine stack, above the trampoline address slot.
        "lea rsp, [rdx + 8]",
        "mov rbp, rsi",
        // Third argument: the initial object sits exactly at the new stack
        // pointer.
        "mov rdx, rsp",
        // Hand-rolled call: set up a return address and jump, so the CPU's
        // return predictor is not skewed when the entry function later exits
        // through a plain `ret` in switch_yield/switch_and_reset.
        "lea rcx, [rip + 2f]",
        "push rcx",
        // The entry function address sits one word above the parent link.
        "jmp [rsi + 8]",
        "2:",
        ".cfi_endproc",
    }
}

/// Switches to the coroutine suspended at `sp`, linking the current stack
/// through the parent link at `stack_base`.
///
/// Returns the value the coroutine passed out and its new suspended stack
/// pointer, `None` once it has finished.
#[inline]
pub unsafe fn switch_and_link(
    arg: EncodedValue,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    // Safety: inline assembly
    unsafe {
        asm! {
            // rbx is an LLVM-reserved register and cannot appear in the
            // clobber list, so save it by hand. rbp is pushed later, by the
            // target, to keep the frame-pointer chain intact.
            "push rbx",
            // Jump to the resume address at the top of the coroutine stack
            // (the trampoline on the first switch, a switch_yield resume
            // label afterwards), leaving our return address on this stack.
            "call [rdx]",
            // Back from the coroutine: rsi holds its suspended stack pointer
            // or 0, rdi the transferred value.
            "pop rbx",

            inlateout("rdi") arg => ret_val,
            inlateout("rsi") stack_base.get() => ret_sp,
            in("rdx") sp.get() as u64,
            // Everything else is clobbered; listing the remaining
            // callee-saved registers here lets the compiler coalesce saves
            // across consecutive switches.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the current coroutine through its parent link.
///
/// Must stay inlined into the coroutine so the pushed resume address returns
/// into the correct frame.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    // Safety: inline assembly
    unsafe {
        asm! {
            // Save the two registers the clobber list cannot express, plus
            // our resume address.
            "push rbp",
            "push rbx",
            "lea rax, [rip + 2f]",
            "push rax",
            // Hand our stack pointer out through rsi and return into the
            // parent context (its `call` pushed the return address, its
            // partner `push rbp` sits above it).
            "mov rsi, rsp",
            "mov rsp, [rdx]",
            "pop rbp",
            "ret",

            // Resumed again by a later switch_and_link: same register state
            // as the trampoline sees.
            "2:",
            "push rbp",
            "mov [rsi - 16], rsp",
            "lea rsp, [rdx + 8]",
            "pop rbx",
            "pop rbp",

            inlateout("rdi") arg => ret_val,
            in("rdx") parent_link as u64,
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    ret_val
}

/// Leaves the coroutine permanently, reporting a null stack pointer to the
/// resumer. The coroutine stack is not unwound.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    // Safety: inline assembly
    unsafe {
        asm! {
            "mov rsp, [{parent_link}]",
            "pop rbp",
            "ret",

            parent_link = in(reg) parent_link as u64,
            in("rdi") arg,
            // Zero stack pointer: tells switch_and_link the coroutine is done.
            in("rsi") 0,
            options(noreturn),
        }
    }
}
