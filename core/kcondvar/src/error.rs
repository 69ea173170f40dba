//! Wait statuses and configuration errors.

use core::fmt;

use crate::sched::Interrupt;

/// Why a blocking wait returned without being woken by a signal or
/// broadcast.
///
/// These are ordinary statuses, not faults: a timed or interruptible wait
/// hands them back to its caller, which usually propagates them outward.
/// The caller's lock is held again whenever one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitError {
    /// The deadline passed before the context was woken.
    TimedOut,
    /// An asynchronous signal aborted the wait; the operation should fail.
    Interrupted,
    /// An asynchronous signal aborted the wait; the operation may be
    /// restarted from the top.
    Restart,
}

impl WaitError {
    /// Returns the error description.
    pub const fn as_str(&self) -> &'static str {
        match self {
            WaitError::TimedOut => "wait timed out",
            WaitError::Interrupted => "wait interrupted",
            WaitError::Restart => "wait interrupted, restart the operation",
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for WaitError {}

impl From<Interrupt> for WaitError {
    fn from(action: Interrupt) -> Self {
        match action {
            Interrupt::Fail => WaitError::Interrupted,
            Interrupt::Restart => WaitError::Restart,
        }
    }
}

/// An invalid [`SleepQueueConfig`](crate::SleepQueueConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The bucket count is zero, not a power of two, or too large.
    BadBucketCount(usize),
    /// The hash shift is not smaller than the pointer width.
    BadHashShift(u32),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BadBucketCount(n) => {
                write!(f, "bucket count {n} is not a power of two in 1..=65536")
            }
            ConfigError::BadHashShift(s) => write!(f, "hash shift {s} exceeds pointer width"),
        }
    }
}

impl core::error::Error for ConfigError {}
