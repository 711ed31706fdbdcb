use core::fmt;

/// Why a blocking wait returned without its wakeup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitError {
    /// The validation check failed before the caller went to sleep, usually
    /// because the watched value changed. A retry signal, not a failure.
    Invalid,
    /// The deadline elapsed and no wake was observed.
    Timeout,
    /// A multi-key wait listed zero or more than the supported number of
    /// keys.
    InvalidKeyCount,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Invalid => f.write_str("value check failed, not parked"),
            WaitError::Timeout => f.write_str("wait timed out"),
            WaitError::InvalidKeyCount => f.write_str("unsupported number of wait keys"),
        }
    }
}

impl core::error::Error for WaitError {}

/// A runtime operation was invoked from a thread that is not running a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotATask(pub(crate) ());

impl fmt::Display for NotATask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("caller is not a task")
    }
}

impl core::error::Error for NotATask {}
