use core::{
    mem::ManuallyDrop,
    ops::DerefMut,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    error::WaitError,
    lock::WaitLock,
    sched::{Interrupt, Priority, Scheduler},
    sleepq::{SleepMode, SleepQueues, WaitChannel, Wakeup},
};

/// A condition variable whose waiters sleep on the shared sleep queues.
///
/// The variable's own address is its wait channel. Every wait must hold a
/// lock protecting the condition; the lock is released once the waiter is
/// queued, so a signal issued under the same lock can never be missed.
///
/// Wakeups may be spurious: re-check the condition in a loop, or use
/// [`wait_while`](Self::wait_while).
pub struct Condvar<'q, S: Scheduler> {
    queues: &'q SleepQueues<S>,
    description: &'static str,
    waiters: AtomicUsize,
}

impl<'q, S: Scheduler> Condvar<'q, S> {
    /// Creates a condition variable with no waiters.
    pub const fn new(queues: &'q SleepQueues<S>, description: &'static str) -> Self {
        Self {
            queues,
            description,
            waiters: AtomicUsize::new(0),
        }
    }

    /// Returns the description given at construction.
    #[inline]
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Returns the number of contexts currently waiting.
    ///
    /// Only a hint unless the caller holds the bucket guard.
    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Returns the wait channel waiters sleep on.
    #[inline]
    pub fn wchan(&self) -> WaitChannel {
        WaitChannel::of(self)
    }

    fn block<L: WaitLock + ?Sized>(
        &self,
        lock: &mut L,
        interruptible: bool,
        timeout: Option<Duration>,
        relock: bool,
    ) -> Result<(), WaitError> {
        let sq = self.queues.lock(self.wchan());
        let mode = SleepMode {
            interruptible,
            timeout,
            description: self.description,
        };
        self.queues.sleep(sq, Some(&self.waiters), lock, mode, relock)
    }

    /// Blocks until signaled.
    ///
    /// `lock` is released while sleeping and held again on return.
    pub fn wait<L: WaitLock + ?Sized>(&self, lock: &mut L) {
        let res = self.block(lock, false, None, true);
        debug_assert_eq!(res, Ok(()));
    }

    /// Blocks until signaled or interrupted by an asynchronous signal.
    ///
    /// `lock` is held again on return, whatever the outcome.
    pub fn wait_interruptible<L: WaitLock + ?Sized>(
        &self,
        lock: &mut L,
    ) -> Result<(), WaitError> {
        self.block(lock, true, None, true)
    }

    /// Blocks until signaled or until `timeout` has elapsed.
    pub fn wait_timeout<L: WaitLock + ?Sized>(
        &self,
        lock: &mut L,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        self.block(lock, false, Some(timeout), true)
    }

    /// Blocks until signaled, interrupted or until `timeout` has elapsed.
    pub fn wait_timeout_interruptible<L: WaitLock + ?Sized>(
        &self,
        lock: &mut L,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        self.block(lock, true, Some(timeout), true)
    }

    /// Blocks until signaled and returns with `lock` released.
    pub fn wait_unlock<L: WaitLock>(&self, lock: L) {
        // The wait releases the lock and never takes it back, so the
        // guard's own unlock must not run.
        let mut lock = ManuallyDrop::new(lock);
        let res = self.block(&mut *lock, false, None, false);
        debug_assert_eq!(res, Ok(()));
    }

    /// Blocks for as long as `condition` returns `true`.
    ///
    /// The condition is evaluated with the lock held, before the first
    /// wait and after every wakeup.
    pub fn wait_while<L, T, F>(&self, lock: &mut L, mut condition: F)
    where
        L: WaitLock + DerefMut<Target = T>,
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **lock) {
            self.wait(lock);
        }
    }

    /// Wakes the earliest waiter, if any.
    pub fn signal(&self) -> Wakeup {
        self.signal_pri(None)
    }

    /// Like [`signal`](Self::signal), donating `pri` to the woken context.
    pub fn signal_pri(&self, pri: Option<Priority>) -> Wakeup {
        let wakeup = {
            let mut sq = self.queues.lock(self.wchan());
            if self.waiters.load(Ordering::Relaxed) == 0 {
                return Wakeup::default();
            }
            sq.signal_pri(pri)
        };
        self.queues.propagate(wakeup);
        wakeup
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) -> Wakeup {
        self.broadcast_pri(None)
    }

    /// Like [`broadcast`](Self::broadcast), donating `pri` to every woken
    /// context.
    pub fn broadcast_pri(&self, pri: Option<Priority>) -> Wakeup {
        let wakeup = {
            let mut sq = self.queues.lock(self.wchan());
            if self.waiters.load(Ordering::Relaxed) == 0 {
                return Wakeup::default();
            }
            let wakeup = sq.broadcast_pri(pri);
            debug_assert_eq!(self.waiters.load(Ordering::Relaxed), 0);
            wakeup
        };
        self.queues.propagate(wakeup);
        wakeup
    }

    /// Delivers an asynchronous signal to `ctx` if it is in an
    /// interruptible wait here. Its wait then fails with the matching
    /// [`WaitError`].
    pub fn abort(&self, ctx: &S::Context, action: Interrupt) -> bool {
        self.queues.abort(self.wchan(), ctx, action)
    }

    /// Wakes `ctx` if it waits here, as if it had been signaled.
    pub fn cancel(&self, ctx: &S::Context) -> bool {
        self.queues.cancel(self.wchan(), ctx)
    }

    /// Tears the condition variable down.
    ///
    /// The waiter count mirrors the queued entries, so a zero count means
    /// nothing is left on the channel. Build a new value to use it again.
    ///
    /// # Panics
    ///
    /// Panics if any context still waits on it.
    pub fn destroy(self) {
        let waiters = self.waiters.load(Ordering::Relaxed);
        assert_eq!(waiters, 0, "{} destroyed with {waiters} waiters", self.description);
    }
}

impl<S: Scheduler> Drop for Condvar<'_, S> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.waiters.load(Ordering::Relaxed),
            0,
            "{} dropped with waiters",
            self.description
        );
    }
}

impl<S: Scheduler> core::fmt::Debug for Condvar<'_, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condvar")
            .field("description", &self.description)
            .field("waiters", &self.waiters())
            .finish()
    }
}
