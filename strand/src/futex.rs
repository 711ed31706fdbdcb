//! Futex-style wait/wake on user memory.
//!
//! A thin, sized surface over the parking lot: [`wait`] compares the bytes at
//! a user address against an expected value and parks on that address;
//! [`wake`] and [`requeue`] select parked waiters by evaluating a compact
//! [`Filter`] against their park tokens. Every blocking primitive in the
//! runtime bottoms out here.
//!
//! These functions are `unsafe`: the parking lot treats keys as opaque
//! identities, but this layer dereferences them, so callers vouch that each
//! key points to live, suitably aligned memory for the given width.

use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};

use arrayvec::ArrayVec;
use mycelium_bitfield::{FromBits, bitfield};

use crate::error::WaitError;
use crate::park::{self, FilterOp, MAX_PARK_KEYS, MultiParkResult, ParkResult, UnparkResult};
use crate::time::Instant;

/// Operand width of a futex access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Width {
    U8 = 0b00,
    U16 = 0b01,
    U32 = 0b10,
    U64 = 0b11,
}

/// Comparator of a wake [`Filter`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Cmp {
    Eq = 0b000,
    Ne = 0b001,
    Lt = 0b010,
    Le = 0b011,
    Gt = 0b100,
    Ge = 0b101,
}

impl FromBits<u32> for Width {
    const BITS: u32 = 2;
    type Error = core::convert::Infallible;

    fn try_from_bits(bits: u32) -> Result<Self, Self::Error> {
        Ok(match bits as u8 {
            bits if bits == Self::U8 as u8 => Self::U8,
            bits if bits == Self::U16 as u8 => Self::U16,
            bits if bits == Self::U32 as u8 => Self::U32,
            _ => Self::U64,
        })
    }

    fn into_bits(self) -> u32 {
        self as u32
    }
}

impl FromBits<u32> for Cmp {
    const BITS: u32 = 3;
    type Error = core::convert::Infallible;

    fn try_from_bits(bits: u32) -> Result<Self, Self::Error> {
        Ok(match bits as u8 {
            bits if bits == Self::Eq as u8 => Self::Eq,
            bits if bits == Self::Ne as u8 => Self::Ne,
            bits if bits == Self::Lt as u8 => Self::Lt,
            bits if bits == Self::Le as u8 => Self::Le,
            bits if bits == Self::Gt as u8 => Self::Gt,
            bits if bits == Self::Ge as u8 => Self::Ge,
            // 0b110 and 0b111 are rejected before decoding, see
            // `Filter::parts`.
            _ => unreachable!("unassigned comparator encoding"),
        })
    }

    fn into_bits(self) -> u32 {
        self as u32
    }
}

bitfield! {
    /// Packed operation word of a [`Filter`].
    pub struct FilterWord<u32> {
        /// Comparator between the masked token value and the argument.
        pub const CMP: Cmp;
        /// Operand width for dereferences.
        pub const WIDTH: Width;
        /// Treat the park token as a pointer and compare the pointee.
        pub const TOKEN_DEREF: bool;
        /// Treat the argument as a pointer and compare against the pointee.
        pub const ARG_DEREF: bool;
    }
}

/// Bits of [`FilterWord`] that carry meaning; anything else set in a raw
/// encoding makes it invalid.
const FILTER_WORD_BITS: u32 = 0x7F;

/// A compact predicate over park tokens, evaluated at wake time.
///
/// The comparison is `(deref?(token) & mask) cmp deref?(arg)`, with both
/// optional dereferences reading `width` bytes. [`Filter::ALL`] selects
/// every waiter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Filter {
    op: u32,
    mask: usize,
    arg: usize,
}

/// The validated pieces of a filter word, extracted once per wake operation.
#[derive(Copy, Clone)]
struct FilterParts {
    cmp: Cmp,
    width: Width,
    token_deref: bool,
    arg_deref: bool,
}

impl Width {
    /// Value mask for this width.
    pub fn mask(self) -> u64 {
        match self {
            Width::U8 => u64::from(u8::MAX),
            Width::U16 => u64::from(u16::MAX),
            Width::U32 => u64::from(u32::MAX),
            Width::U64 => u64::MAX,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
            Width::U64 => 8,
        }
    }
}

impl Filter {
    /// Matches every waiter: `(token & 0) == 0`.
    pub const ALL: Filter = Filter {
        op: 0,
        mask: 0,
        arg: 0,
    };

    /// Filter comparing the raw token against `arg`.
    pub fn token(cmp: Cmp, arg: usize) -> Filter {
        Filter {
            op: FilterWord::new()
                .with(FilterWord::CMP, cmp)
                .with(FilterWord::WIDTH, Width::U64)
                .0,
            mask: usize::MAX,
            arg,
        }
    }

    /// Restricts the token comparison to the bits in `mask`.
    #[must_use]
    pub fn with_mask(mut self, mask: usize) -> Filter {
        self.mask = mask;
        self
    }

    /// Dereferences the token as a pointer to a `width`-sized value before
    /// comparing.
    #[must_use]
    pub fn with_token_deref(mut self, width: Width) -> Filter {
        self.op = FilterWord::from_bits(self.op)
            .with(FilterWord::TOKEN_DEREF, true)
            .with(FilterWord::WIDTH, width)
            .0;
        self
    }

    /// Dereferences the argument as a pointer to a `width`-sized value.
    #[must_use]
    pub fn with_arg_deref(mut self, width: Width) -> Filter {
        self.op = FilterWord::from_bits(self.op)
            .with(FilterWord::ARG_DEREF, true)
            .with(FilterWord::WIDTH, width)
            .0;
        self
    }

    /// Reassembles a filter from its wire encoding, rejecting words with
    /// unknown bits or out-of-range fields. Ill-formed encodings are refused
    /// here, before any evaluation could dereference through them.
    pub fn from_raw(op: u32, mask: usize, arg: usize) -> Result<Filter, WaitError> {
        let filter = Filter { op, mask, arg };
        filter.parts()?;
        Ok(filter)
    }

    /// The raw `(op, mask, arg)` encoding.
    pub fn to_raw(self) -> (u32, usize, usize) {
        (self.op, self.mask, self.arg)
    }

    fn parts(self) -> Result<FilterParts, WaitError> {
        if self.op & !FILTER_WORD_BITS != 0 {
            return Err(WaitError::Invalid);
        }
        // The comparator occupies the three low bits; 0b110 and 0b111 are
        // unassigned encodings.
        if (self.op & 0b111) as u8 > Cmp::Ge as u8 {
            return Err(WaitError::Invalid);
        }
        let word = FilterWord::from_bits(self.op);
        Ok(FilterParts {
            cmp: word.get(FilterWord::CMP),
            width: word.get(FilterWord::WIDTH),
            token_deref: word.get(FilterWord::TOKEN_DEREF),
            arg_deref: word.get(FilterWord::ARG_DEREF),
        })
    }
}

impl FilterParts {
    /// Evaluates the predicate against a waiter's park token.
    ///
    /// # Safety
    ///
    /// With the deref flags set, `token` (resp. the filter argument) must
    /// point to live memory readable at the filter width.
    unsafe fn matches(self, filter: &Filter, token: usize) -> bool {
        // Safety: ensured by caller
        let lhs = if self.token_deref {
            unsafe { load(token as *const (), self.width) }
        } else {
            token as u64
        };
        let lhs = lhs & filter.mask as u64;

        // Safety: ensured by caller
        let rhs = if self.arg_deref {
            unsafe { load(filter.arg as *const (), self.width) }
        } else {
            filter.arg as u64
        };

        match self.cmp {
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Ge => lhs >= rhs,
        }
    }
}

/// One key of a [`wait_many`] call.
#[derive(Copy, Clone, Debug)]
pub struct WaitKey {
    pub key: *const (),
    pub size: Width,
    pub expect: u64,
}

/// Atomically reads `size` bytes at `key` with acquire ordering.
///
/// # Safety
///
/// `key` must point to live memory readable at `size` bytes and aligned for
/// that width.
unsafe fn load(key: *const (), size: Width) -> u64 {
    // Safety: ensured by caller
    unsafe {
        match size {
            Width::U8 => u64::from((*key.cast::<AtomicU8>()).load(Ordering::Acquire)),
            Width::U16 => u64::from((*key.cast::<AtomicU16>()).load(Ordering::Acquire)),
            Width::U32 => u64::from((*key.cast::<AtomicU32>()).load(Ordering::Acquire)),
            Width::U64 => (*key.cast::<AtomicU64>()).load(Ordering::Acquire),
        }
    }
}

/// Parks the calling context on `key` while the value at `key` equals
/// `expect`.
///
/// Returns the unpark token on a wake. A value mismatch — observed either
/// before queueing or under the bucket lock — returns
/// [`WaitError::Invalid`] without sleeping.
///
/// # Safety
///
/// `key` must point to live memory readable at `size` bytes, aligned for
/// that width, for the duration of the call.
pub unsafe fn wait(
    key: *const (),
    size: Width,
    expect: u64,
    token: usize,
    deadline: Option<Instant>,
) -> Result<usize, WaitError> {
    let expect = expect & size.mask();

    // Safety: ensured by caller
    if unsafe { load(key, size) } != expect {
        return Err(WaitError::Invalid);
    }

    let result = park::park(
        key as usize,
        // Safety: ensured by caller
        || unsafe { load(key, size) } == expect,
        || {},
        |_, _| {},
        token,
        deadline,
    );

    match result {
        ParkResult::Unparked(token) => Ok(token),
        ParkResult::Invalid => Err(WaitError::Invalid),
        ParkResult::TimedOut => Err(WaitError::Timeout),
    }
}

/// Parks the calling context on up to [`MAX_PARK_KEYS`] keys at once; a wake
/// on any key resumes it. Returns `(index, token)` identifying which key
/// fired.
///
/// # Safety
///
/// Every listed key must satisfy the [`wait`] requirements.
pub unsafe fn wait_many(
    waits: &[WaitKey],
    token: usize,
    deadline: Option<Instant>,
) -> Result<(usize, usize), WaitError> {
    if waits.is_empty() || waits.len() > MAX_PARK_KEYS {
        return Err(WaitError::InvalidKeyCount);
    }

    let keys: ArrayVec<usize, MAX_PARK_KEYS> = waits.iter().map(|w| w.key as usize).collect();

    let result = park::park_multiple(
        &keys,
        |i| {
            let w = &waits[i];
            // Safety: ensured by caller
            unsafe { load(w.key, w.size) == w.expect & w.size.mask() }
        },
        || {},
        token,
        deadline,
    );

    match result {
        MultiParkResult::Unparked { index, token } => Ok((index, token)),
        MultiParkResult::Invalid => Err(WaitError::Invalid),
        MultiParkResult::TimedOut => Err(WaitError::Timeout),
        MultiParkResult::KeyError => Err(WaitError::InvalidKeyCount),
    }
}

/// Wakes up to `max` waiters parked on `key` whose park tokens match
/// `filter`. Returns the number woken.
///
/// # Safety
///
/// With deref flags set in `filter`, the tokens of the waiters parked on
/// `key` (resp. the filter argument) must be valid pointers per the filter
/// width.
pub unsafe fn wake(key: *const (), max: usize, filter: Filter) -> Result<usize, WaitError> {
    let parts = filter.parts()?;
    let mut selected = 0usize;

    let result = park::unpark_filter(
        key as usize,
        |token| {
            if selected >= max {
                return FilterOp::Stop;
            }
            // Safety: ensured by caller
            if unsafe { parts.matches(&filter, token) } {
                selected += 1;
                FilterOp::Unpark
            } else {
                FilterOp::Skip
            }
        },
        |_| 0,
    );

    Ok(result.unparked)
}

/// Wakes up to `max_wakes` matching waiters from `from` and moves up to
/// `max_requeues` further waiters onto `to`, provided the value at `from`
/// still equals `expect` (checked with both bucket locks held).
///
/// # Safety
///
/// `from` must satisfy the [`wait`] requirements for `size`; filter derefs
/// as in [`wake`].
pub unsafe fn requeue(
    from: *const (),
    to: *const (),
    size: Width,
    expect: u64,
    max_wakes: usize,
    max_requeues: usize,
    filter: Filter,
) -> Result<UnparkResult, WaitError> {
    let parts = filter.parts()?;
    let expect = expect & size.mask();
    let mut value_matched = true;

    let result = park::unpark_requeue(
        from as usize,
        to as usize,
        || {
            // Safety: ensured by caller
            if unsafe { load(from, size) } == expect {
                Some((max_wakes, max_requeues))
            } else {
                value_matched = false;
                None
            }
        },
        // Safety: ensured by caller
        |token| {
            if unsafe { parts.matches(&filter, token) } {
                FilterOp::Unpark
            } else {
                FilterOp::Skip
            }
        },
        |_| 0,
    );

    if value_matched {
        Ok(result)
    } else {
        Err(WaitError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_returns_invalid_without_parking() {
        let word = AtomicU32::new(5);
        // Safety: `word` is live and aligned.
        let result = unsafe {
            wait(
                core::ptr::from_ref(&word).cast(),
                Width::U32,
                4,
                0,
                None,
            )
        };
        assert_eq!(result, Err(WaitError::Invalid));
    }

    #[test]
    fn filter_all_matches_everything() {
        let parts = Filter::ALL.parts().unwrap();
        for token in [0usize, 1, usize::MAX] {
            // Safety: no deref flags set.
            assert!(unsafe { parts.matches(&Filter::ALL, token) });
        }
    }

    #[test]
    fn token_comparators() {
        let cases = [
            (Cmp::Eq, 3usize, vec![3usize], vec![2usize, 4]),
            (Cmp::Ne, 3, vec![2, 4], vec![3]),
            (Cmp::Lt, 3, vec![0, 2], vec![3, 4]),
            (Cmp::Le, 3, vec![3, 2], vec![4]),
            (Cmp::Gt, 3, vec![4], vec![3, 0]),
            (Cmp::Ge, 3, vec![3, 9], vec![2]),
        ];
        for (cmp, arg, yes, no) in cases {
            let filter = Filter::token(cmp, arg);
            let parts = filter.parts().unwrap();
            for token in yes {
                // Safety: no deref flags set.
                assert!(unsafe { parts.matches(&filter, token) }, "{cmp:?} {token}");
            }
            for token in no {
                // Safety: no deref flags set.
                assert!(!unsafe { parts.matches(&filter, token) }, "{cmp:?} {token}");
            }
        }
    }

    #[test]
    fn mask_applies_to_token() {
        let filter = Filter::token(Cmp::Eq, 0x0A).with_mask(0x0F);
        let parts = filter.parts().unwrap();
        // Safety: no deref flags set.
        unsafe {
            assert!(parts.matches(&filter, 0xFA));
            assert!(parts.matches(&filter, 0x3A));
            assert!(!parts.matches(&filter, 0x3B));
        }
    }

    #[test]
    fn token_deref_reads_pointee() {
        let value = AtomicU32::new(77);
        let filter = Filter::token(Cmp::Eq, 77).with_token_deref(Width::U32);
        let parts = filter.parts().unwrap();
        let token = core::ptr::from_ref(&value) as usize;
        // Safety: token points at `value`, readable at u32 width.
        assert!(unsafe { parts.matches(&filter, token) });
    }

    #[test]
    fn malformed_encodings_are_rejected() {
        // Unknown high bits.
        assert_eq!(Filter::from_raw(0x100, 0, 0), Err(WaitError::Invalid));
        // Comparator out of range (0b110 and 0b111 are unassigned).
        assert_eq!(Filter::from_raw(0b110, 0, 0), Err(WaitError::Invalid));
        // A well-formed roundtrip survives.
        let filter = Filter::token(Cmp::Ge, 10).with_mask(0xFF);
        let (op, mask, arg) = filter.to_raw();
        assert_eq!(Filter::from_raw(op, mask, arg), Ok(filter));
    }

    #[test]
    fn wait_and_wake_across_threads() {
        static WORD: AtomicU32 = AtomicU32::new(1);

        let waiter = std::thread::spawn(|| {
            // Safety: WORD is static, aligned.
            unsafe {
                wait(
                    core::ptr::from_ref(&WORD).cast(),
                    Width::U32,
                    1,
                    0,
                    None,
                )
            }
        });

        // Keep waking until the waiter is actually queued.
        loop {
            // Safety: WORD is static; Filter::ALL has no derefs.
            let woken = unsafe {
                wake(core::ptr::from_ref(&WORD).cast(), usize::MAX, Filter::ALL)
            }
            .unwrap();
            if woken == 1 {
                break;
            }
            std::thread::yield_now();
        }

        assert_eq!(waiter.join().unwrap(), Ok(0));
    }
}
