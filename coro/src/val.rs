use core::mem::ManuallyDrop;
use core::ptr;

/// A value transferred across a context switch, packed into one register.
///
/// Register-sized values travel directly; anything larger is passed as a
/// pointer into the sending frame, which stays alive until the receiving side
/// has read it (the sender is suspended for exactly that window).
pub type EncodedValue = usize;

/// Encodes `val`, logically taking ownership of it. The caller must not drop
/// the original afterwards.
pub unsafe fn encode<T>(val: &mut ManuallyDrop<T>) -> EncodedValue {
    // Safety: ensured by caller
    unsafe {
        if size_of::<T>() <= size_of::<EncodedValue>() {
            let mut out = 0;
            ptr::write_unaligned(ptr::from_mut(&mut out).cast::<T>(), ManuallyDrop::take(val));
            out
        } else {
            ptr::from_ref(val) as EncodedValue
        }
    }
}

/// Decodes a value produced by [`encode`] on the other side of a switch.
pub unsafe fn decode<T>(val: EncodedValue) -> T {
    // Safety: ensured by caller
    unsafe {
        if size_of::<T>() <= size_of::<EncodedValue>() {
            ptr::read_unaligned(ptr::from_ref(&val).cast::<T>())
        } else {
            ptr::read(val as *const T)
        }
    }
}
