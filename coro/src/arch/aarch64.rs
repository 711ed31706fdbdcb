//! aarch64 context switching.
//!
//! Register protocol shared by all switch flavors:
//!
//! - `x0` carries the transferred value in both directions.
//! - `x1` carries the coroutine stack base into a switch and the suspended
//!   stack pointer (or 0 for a finished coroutine) back out.
//! - `x2` carries the target stack pointer into a switch.
//!
//! As on x86-64, the two words at the base of every coroutine stack are the
//! entry function address (`base - 8`) and the parent link (`base - 16`).
//!
//! A suspended coroutine stack stores, from the stack pointer upward:
//!
//! ```text
//! sp + 24  padding
//! sp + 16  resume PC
//! sp +  8  saved x29
//! sp +  0  saved x19
//! ```
//!
//! and the parent stack, while its coroutine runs:
//!
//! ```text
//! sp + 24  padding
//! sp + 16  saved x19
//! sp +  8  saved lr
//! sp +  0  saved x29
//! ```
//!
//! x19 is the one callee-saved register LLVM reserves on this target and so
//! has to be spilled by hand; the rest travel through the clobber list.

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
        // stack pointer.
        write_obj_on_stack(&mut sp, 16, obj);

        debug_assert_eq!(sp % STACK_ALIGNMENT, 0);

        // Mimic the suspended-stack layout above: padding, the resume PC at
        // sp + 16, and two dummy register slots below it.
        push(&mut sp, None);
        push(&mut sp, Some(stack_init_trampoline as usize));
        push(&mut sp, None);
        push(&mut sp, None);

        StackPointer::new_unchecked(sp)
    }
}

/// First-resume entry point. Reached via `blr` from `switch_and_link` with
/// the parent stack still active.
///
/// On entry: `sp` = parent stack, `lr` = parent return address, `x2` =
/// coroutine stack pointer, `x1` = coroutine stack base, `x0` = transferred
/// value.
#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 4",
        ".cfi_startproc",
        // Spill the parent's x29/lr/x19 onto its stack and publish the
        // resulting stack pointer through the parent link; the pre-decrement
        // leaves x1 pointing at the link itself, which doubles as the second
        // argument of the entry function.
        "stp x29, lr, [sp, #-32]!",
        "str x19, [sp, #16]",
        "mov x3, sp",
        "str x3, [x1, #-16]!",
        // Move onto the coroutine stack, past the four bootstrap words.
        "add sp, x2, #32",
        "mov x29, x1",
        // Third argument: the initial object sits exactly at the new stack
        // pointer.
        "mov x2, sp",
        // Hand-rolled call so the return predictor stays balanced when the
        // entry function exits through `ret` in switch_yield/switch_and_reset.
        "adr lr, 0f",
        "ldr x3, [x1, #8]",
        "br x3",
        "0:",
        ".cfi_endproc",
    }
}

/// Switches to the coroutine suspended at `sp`, linking the current stack
/// through the parent link at `stack_base`.
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
            // Call the resume PC stored on the coroutine stack.
            "ldr x3, [x2, #16]",
            "blr x3",
            // Back from the coroutine with x2 = our own spilled-register
            // block; drop it.
            "add sp, x2, #32",

            inlateout("x0") arg => ret_val,
            inlateout("x1") stack_base.get() => ret_sp,
            in("x2") sp.get() as u64,
            lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
            lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
            lateout("x28") _,
            clobber_abi("C"),
        }
    }

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the current coroutine through its parent link.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    // Safety: inline assembly
    unsafe {
        asm! {
            // Build our suspended-stack block: x19/x29 plus the resume PC.
            "stp x19, x29, [sp, #-32]!",
            "adr lr, 0f",
            "str lr, [sp, #16]",
            // Hand our stack pointer out through x1, restore the parent's
            // registers from its block and return into switch_and_link.
            "ldr x2, [x2]",
            "mov x1, sp",
            "ldr x19, [x2, #16]",
            "ldp x29, lr, [x2]",
            "ret",

            // Resumed again by a later switch_and_link: same register state
            // as the trampoline sees.
            "0:",
            "stp x29, lr, [sp, #-32]!",
            "str x19, [sp, #16]",
            "mov x3, sp",
            "str x3, [x1, #-16]",
            "ldp x19, x29, [x2]",
            "add sp, x2, #32",

            inlateout("x0") arg => ret_val,
            in("x2") parent_link as u64,
            lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
            lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
            lateout("x28") _,
            clobber_abi("C"),
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
            "ldr x2, [{parent_link}]",
            "ldr x19, [x2, #16]",
            "ldp x29, lr, [x2]",
            "ret",

            parent_link = in(reg) parent_link as u64,
            in("x0") arg,
            // Zero stack pointer: tells switch_and_link the coroutine is done.
            in("x1") 0,
            options(noreturn),
        }
    }
}
