//! Adaptive spinning shared by the blocking lock kinds.

use crate::sched::Scheduler;

/// Spin configuration for [`SleepLock`](crate::SleepLock) and
/// [`Giant`](crate::Giant).
///
/// # Valid Ranges
///
/// - `max_spins`: Should be in the range 1..=100 for reasonable behavior
/// - `spin_before_yield`: Should be <= `max_spins` and <= 10 (the backoff
///   doubles on every step)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinConfig {
    /// Maximum number of spin iterations before giving up the fast path
    pub max_spins: u32,
    /// Number of busy-wait spins before yielding instead
    pub spin_before_yield: u32,
}

impl SpinConfig {
    /// The configuration used by `Default`.
    pub const DEFAULT: Self = Self {
        max_spins: 10,
        spin_before_yield: 3,
    };
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One round of adaptive spinning.
pub(crate) struct Spin {
    count: u32,
    config: SpinConfig,
}

impl Spin {
    #[inline]
    pub(crate) fn new(config: SpinConfig) -> Self {
        Self { count: 0, config }
    }

    /// Perform one spin iteration.
    ///
    /// Returns `false` once the budget is spent. The first
    /// `spin_before_yield` iterations busy-wait `1 << count` times, later
    /// ones yield through the scheduler.
    #[inline]
    pub(crate) fn spin<S: Scheduler>(&mut self, sched: &S) -> bool {
        if self.count >= self.config.max_spins {
            return false;
        }
        self.count += 1;
        if self.count <= self.config.spin_before_yield {
            for _ in 0..(1u32 << self.count.min(10)) {
                core::hint::spin_loop();
            }
        } else {
            sched.yield_now();
        }
        true
    }

    /// Starts the budget over, after a wakeup.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}
