//! Monotonic time for deadlines.
//!
//! Blocking APIs in this crate take *absolute* deadlines. Converting a
//! relative timeout happens exactly once, at the call site, via
//! [`Instant::saturating_add`]; re-deriving it later from a fresh "now" would
//! let a long park time out spuriously.

use core::fmt;
use core::ops::Add;
use core::time::Duration;
use std::sync::OnceLock;

/// An opaque, non-decreasing point in time with nanosecond resolution.
///
/// Internally a nanosecond count from a process-local anchor captured on
/// first use; the absolute value is meaningless outside this process.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Instant(u64);

impl Instant {
    /// The farthest representable point in time. Arithmetic saturates here
    /// instead of wrapping.
    pub const MAX: Instant = Instant(u64::MAX);

    /// The current instant on the monotonic clock.
    pub fn now() -> Instant {
        let elapsed = anchor().elapsed().as_nanos();
        Instant(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    /// Raw nanosecond count since the process anchor.
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// `self + d`, clamped to [`Instant::MAX`].
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Instant {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Instant(self.0.saturating_add(nanos))
    }

    /// Time from `earlier` to `self`, `None` if `earlier` is later.
    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_nanos)
    }

    /// Time from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, d: Duration) -> Instant {
        self.saturating_add(d)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:?}", Duration::from_nanos(self.0))
    }
}

/// Absolute deadline `d` from now, for the common "relative timeout" case.
pub fn deadline_after(d: Duration) -> Instant {
    Instant::now().saturating_add(d)
}

fn anchor() -> &'static std::time::Instant {
    static ANCHOR: OnceLock<std::time::Instant> = OnceLock::new();
    ANCHOR.get_or_init(std::time::Instant::now)
}

/// Entropy-ish value derived from process start, used to decorrelate
/// per-bucket fairness timers across processes.
pub(crate) fn anchor_entropy() -> u64 {
    // The anchor's address is ASLR-dependent, which is all we need here.
    core::ptr::from_ref(anchor()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = Instant::now();
        let b = Instant::now();
        assert!(b >= a);
    }

    #[test]
    fn saturates_at_max() {
        assert_eq!(Instant::MAX.saturating_add(Duration::from_secs(1)), Instant::MAX);
        let near_max = Instant(u64::MAX - 10);
        assert_eq!(near_max.saturating_add(Duration::from_secs(1)), Instant::MAX);
    }

    #[test]
    fn duration_since() {
        let a = Instant(100);
        let b = Instant(350);
        assert_eq!(b.checked_duration_since(a), Some(Duration::from_nanos(250)));
        assert_eq!(a.checked_duration_since(b), None);
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }
}
