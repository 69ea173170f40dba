//! Hashed sleep queues.
//!
//! A [`SleepQueues`] table multiplexes every wait channel in the system
//! onto a fixed set of buckets. Each bucket is a FIFO of [`SleepEntry`]
//! nodes guarded by its own IRQ-safe spinlock, so unrelated channels never
//! contend on the same guard unless they hash together.
//!
//! The protocol for going to sleep is:
//!
//! 1. [`SleepQueues::lock`] the channel's bucket;
//! 2. enqueue an entry, making the context visible to wakers;
//! 3. release the caller's own lock (see [`WaitLock`] for the ordering);
//! 4. park, which drops the bucket guard and suspends in one step as far
//!    as wakers can tell.
//!
//! Every removal (signal, broadcast, timeout, interruption, cancellation)
//! happens under the bucket guard and only touches linked entries, so each
//! entry leaves its queue exactly once.

use alloc::{boxed::Box, sync::Arc};
use core::{fmt, sync::atomic::AtomicUsize, time::Duration};
#[cfg(feature = "stats")]
use core::sync::atomic::{AtomicU64, Ordering};

use kspin::{SpinNoIrq, SpinNoIrqGuard};

mod entry;

pub(crate) use self::entry::SleepEntry;
pub use self::entry::WakeReason;
use self::entry::Bucket;
use crate::{
    config::SleepQueueConfig,
    error::{ConfigError, WaitError},
    lock::WaitLock,
    sched::{Interrupt, Priority, Residency, Scheduler, WaitObserver},
};

/// Identity of the thing a context waits for.
///
/// Usually the address of the object being waited on. It is only ever
/// hashed and compared, never dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitChannel(usize);

impl WaitChannel {
    /// Creates a channel from a raw address.
    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Creates a channel naming `obj`.
    #[inline]
    pub fn of<T: ?Sized>(obj: &T) -> Self {
        Self(obj as *const T as *const () as usize)
    }

    /// Returns the raw address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Debug for WaitChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WaitChannel({:#x})", self.0)
    }
}

/// Result of a signal or broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    /// Number of contexts made runnable.
    pub woken: usize,
    /// Whether any of them was swapped out.
    pub swap_needed: bool,
}

impl Wakeup {
    fn add(&mut self, residency: Residency) {
        self.woken += 1;
        self.swap_needed |= residency == Residency::Swapped;
    }
}

/// Counters kept with the `stats` feature.
#[cfg(feature = "stats")]
#[derive(Debug, Default)]
struct Counters {
    sleeps: AtomicU64,
    signaled: AtomicU64,
    broadcast: AtomicU64,
    timed_out: AtomicU64,
    interrupted: AtomicU64,
}

/// Snapshot of sleep queue statistics (available with `stats` feature).
#[cfg(feature = "stats")]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SleepQueueStats {
    /// Entries enqueued.
    pub sleeps: u64,
    /// Entries woken by a signal or cancellation.
    pub signaled: u64,
    /// Entries woken by a broadcast.
    pub broadcast: u64,
    /// Entries whose deadline passed.
    pub timed_out: u64,
    /// Entries aborted by an asynchronous signal.
    pub interrupted: u64,
    /// Deepest any bucket has been.
    pub max_depth: usize,
}

/// The system-wide table of sleep queues.
///
/// Built once while the kernel initializes and shared by reference from
/// then on; every [`Condvar`](crate::Condvar) keeps a reference to it.
pub struct SleepQueues<S: Scheduler> {
    sched: S,
    buckets: Box<[SpinNoIrq<Bucket<S::Context>>]>,
    mask: usize,
    shift: u32,
    observer: Option<Arc<dyn WaitObserver>>,
    #[cfg(feature = "stats")]
    counters: Counters,
}

impl<S: Scheduler> SleepQueues<S> {
    /// Creates a table with the default [`SleepQueueConfig`].
    pub fn new(sched: S) -> Self {
        let config = SleepQueueConfig::default();
        Self::build(sched, config)
    }

    /// Creates a table with the given shape.
    pub fn with_config(sched: S, config: SleepQueueConfig) -> Result<Self, ConfigError> {
        config.validate().inspect_err(|err| {
            warn!("rejecting sleep queue config {config:?}: {err}");
        })?;
        Ok(Self::build(sched, config))
    }

    fn build(sched: S, config: SleepQueueConfig) -> Self {
        debug!(
            "sleepq: {} buckets, hash shift {}",
            config.buckets, config.hash_shift
        );
        Self {
            sched,
            buckets: (0..config.buckets)
                .map(|_| SpinNoIrq::new(Bucket::new()))
                .collect(),
            mask: config.buckets - 1,
            shift: config.hash_shift,
            observer: None,
            #[cfg(feature = "stats")]
            counters: Counters::default(),
        }
    }

    /// Installs tracing hooks run around every suspension.
    pub fn set_observer(&mut self, observer: Arc<dyn WaitObserver>) {
        self.observer = Some(observer);
    }

    /// Returns the scheduler the table was built with.
    #[inline]
    pub fn scheduler(&self) -> &S {
        &self.sched
    }

    /// Returns the number of buckets.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the bucket index `wchan` hashes to.
    #[inline]
    pub fn bucket_index(&self, wchan: WaitChannel) -> usize {
        let addr = wchan.addr();
        ((addr >> self.shift) ^ addr) & self.mask
    }

    /// Locks the bucket of `wchan`.
    ///
    /// The guard is a spinlock with IRQs disabled; hold it only for queue
    /// manipulation.
    pub fn lock(&self, wchan: WaitChannel) -> SleepQueueGuard<'_, S> {
        SleepQueueGuard {
            queues: self,
            wchan,
            bucket: self.buckets[self.bucket_index(wchan)].lock(),
        }
    }

    /// Returns the number of contexts sleeping on `wchan`.
    pub fn sleep_count(&self, wchan: WaitChannel) -> usize {
        self.lock(wchan).sleep_count()
    }

    /// Wakes the earliest context sleeping on `wchan`.
    pub fn signal(&self, wchan: WaitChannel) -> Wakeup {
        let wakeup = self.lock(wchan).signal();
        self.propagate(wakeup);
        wakeup
    }

    /// Wakes every context sleeping on `wchan`.
    pub fn broadcast(&self, wchan: WaitChannel) -> Wakeup {
        let wakeup = self.lock(wchan).broadcast();
        self.propagate(wakeup);
        wakeup
    }

    /// Delivers an asynchronous signal to `ctx` if it is in an
    /// interruptible sleep on `wchan`.
    pub fn abort(&self, wchan: WaitChannel, ctx: &S::Context, action: Interrupt) -> bool {
        let residency = self.lock(wchan).abort(ctx, action);
        self.propagate_one(residency)
    }

    /// Delivers an asynchronous signal to `ctx` on whatever channel the
    /// scheduler recorded for it through [`Scheduler::set_wchan`].
    ///
    /// Post the signal where [`Scheduler::pending_interrupt`] reports it
    /// before calling this; a context that has not queued yet then aborts
    /// on its own.
    pub fn abort_context(&self, ctx: &S::Context, action: Interrupt) -> bool {
        match self.sched.wchan(ctx) {
            Some(wchan) => self.abort(wchan, ctx, action),
            None => false,
        }
    }

    /// Removes `ctx` from `wchan` as if it had been signaled.
    pub fn cancel(&self, wchan: WaitChannel, ctx: &S::Context) -> bool {
        let residency = self.lock(wchan).cancel(ctx);
        self.propagate_one(residency)
    }

    /// Passes a finished batch of wakeups on to the swapper.
    ///
    /// Call this after the bucket guard is dropped. The swapper is kicked
    /// at most once per batch.
    pub fn propagate(&self, wakeup: Wakeup) {
        if wakeup.swap_needed {
            trace!("sleepq: {} woken, kicking swapper", wakeup.woken);
            self.sched.kick_swapper();
        }
    }

    fn propagate_one(&self, residency: Option<Residency>) -> bool {
        let Some(residency) = residency else {
            return false;
        };
        let mut wakeup = Wakeup::default();
        wakeup.add(residency);
        self.propagate(wakeup);
        true
    }

    /// Returns the statistics gathered so far (only available with `stats`
    /// feature).
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> SleepQueueStats {
        let c = &self.counters;
        SleepQueueStats {
            sleeps: c.sleeps.load(Ordering::Relaxed),
            signaled: c.signaled.load(Ordering::Relaxed),
            broadcast: c.broadcast.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            interrupted: c.interrupted.load(Ordering::Relaxed),
            max_depth: self
                .buckets
                .iter()
                .map(|b| b.lock().max_depth())
                .max()
                .unwrap_or(0),
        }
    }

    #[cfg(feature = "stats")]
    fn count_removal(&self, reason: WakeReason, n: usize) {
        let c = &self.counters;
        let counter = match reason {
            WakeReason::Signaled => &c.signaled,
            WakeReason::Broadcast => &c.broadcast,
            WakeReason::TimedOut => &c.timed_out,
            WakeReason::Interrupted | WakeReason::Restart => &c.interrupted,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Puts the current context to sleep on the channel locked by `sq`.
    ///
    /// `lock` is released once the entry is queued and, when `relock` is
    /// set, reacquired before returning whatever the outcome. With a pending
    /// signal on an interruptible sleep, returns at once with `lock` still
    /// held. Before the scheduler runs, returns at once as well. If the
    /// sleep unwinds, the entry is unlinked before the frame goes away.
    pub(crate) fn sleep<'a, L: WaitLock + ?Sized>(
        &'a self,
        mut sq: SleepQueueGuard<'a, S>,
        waiters: Option<&AtomicUsize>,
        lock: &mut L,
        mode: SleepMode,
        relock: bool,
    ) -> Result<(), WaitError> {
        let wchan = sq.wchan;
        if !self.sched.is_running() {
            warn!("sleepq: scheduler not running, not sleeping on {wchan:?}");
            drop(sq);
            if !relock {
                let _ = lock.release();
            }
            return Ok(());
        }

        let ctx = self.sched.current();
        if mode.interruptible {
            if let Some(action) = self.sched.pending_interrupt(&ctx) {
                debug!("sleepq: signal pending, not sleeping on {wchan:?}");
                drop(sq);
                if !relock {
                    let _ = lock.release();
                }
                return Err(action.into());
            }
        }

        let deadline = mode.timeout.map(|d| self.sched.now().saturating_add(d));
        let entry = SleepEntry::new(
            wchan,
            ctx,
            mode.interruptible,
            deadline,
            waiters,
            mode.description,
        );
        // SAFETY: `park` does not return before the entry is unlinked, and
        // `waiting` unlinks it if the sleep unwinds instead.
        unsafe { sq.enqueue(&entry) };
        let mut waiting = Waiting {
            queues: self,
            entry: &entry,
            lock,
            state: None,
            relock,
            parked: false,
        };
        // Rebound after `waiting`, so an unwind drops the bucket guard first.
        let mut sq = sq;

        if waiting.lock.is_sleepable() {
            // Taking a sleepable lock back may block, which must never
            // happen under a bucket guard.
            drop(sq);
            waiting.state = Some(waiting.lock.release());
            sq = self.lock(wchan);
        } else {
            waiting.state = Some(waiting.lock.release());
        }

        // SAFETY: the entry was enqueued through this very bucket.
        let reason = unsafe { sq.park(&entry) };
        waiting.parked = true;
        drop(waiting);
        reason.into_result()
    }
}

/// A queued sleep in progress.
///
/// Dropping it before the sleep has completed only happens when the wait
/// unwinds. The entry is then unlinked so the bucket never points into a
/// dead frame. The caller's lock is taken back either way when `relock` is
/// set.
struct Waiting<'a, 'e, 'l, S: Scheduler, L: WaitLock + ?Sized> {
    queues: &'a SleepQueues<S>,
    entry: &'e SleepEntry<S::Context>,
    lock: &'l mut L,
    state: Option<L::State>,
    relock: bool,
    parked: bool,
}

impl<S: Scheduler, L: WaitLock + ?Sized> Drop for Waiting<'_, '_, '_, S, L> {
    fn drop(&mut self) {
        if !self.parked {
            let entry = self.entry;
            let mut sq = self.queues.lock(entry.wchan);
            if entry.reason().is_none() {
                warn!("sleepq: sleep on {:?} unwound, unlinking", entry.wchan);
                self.queues.sched.set_wchan(&entry.ctx, None);
                // SAFETY: the entry has no reason yet, so it is still linked
                // in this bucket.
                unsafe { sq.bucket.remove(entry, WakeReason::Signaled) };
            }
        }
        if self.relock {
            if let Some(state) = self.state.take() {
                self.lock.reacquire(state);
            }
        }
    }
}

/// Clears the channel record of a removed context and makes it runnable.
fn wake<S: Scheduler>(sched: &S, ctx: &S::Context, pri: Option<Priority>) -> Residency {
    sched.set_wchan(ctx, None);
    sched.resume(ctx, pri)
}

fn interrupt_reason(action: Interrupt) -> WakeReason {
    match action {
        Interrupt::Fail => WakeReason::Interrupted,
        Interrupt::Restart => WakeReason::Restart,
    }
}

/// How a context goes to sleep.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SleepMode {
    pub(crate) interruptible: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) description: &'static str,
}

/// Exclusive access to the bucket of one wait channel.
///
/// Dropping the guard releases the bucket.
pub struct SleepQueueGuard<'a, S: Scheduler> {
    queues: &'a SleepQueues<S>,
    wchan: WaitChannel,
    bucket: SpinNoIrqGuard<'a, Bucket<S::Context>>,
}

impl<S: Scheduler> SleepQueueGuard<'_, S> {
    /// Returns the locked channel.
    #[inline]
    pub fn wchan(&self) -> WaitChannel {
        self.wchan
    }

    /// Returns the number of contexts sleeping on the locked channel.
    pub fn sleep_count(&self) -> usize {
        self.bucket.count(self.wchan)
    }

    /// Returns the number of entries in the bucket, counting every channel
    /// that hashes to it.
    pub fn bucket_depth(&self) -> usize {
        self.bucket.depth()
    }

    /// Wakes the earliest context sleeping on the channel.
    pub fn signal(&mut self) -> Wakeup {
        self.signal_pri(None)
    }

    /// Like [`signal`](Self::signal), donating `pri` to the woken context.
    pub fn signal_pri(&mut self, pri: Option<Priority>) -> Wakeup {
        let sched = &self.queues.sched;
        let mut wakeup = Wakeup::default();
        self.bucket
            .remove_first(self.wchan, WakeReason::Signaled, |_| true, |entry| {
                wakeup.add(wake(sched, &entry.ctx, pri));
            });
        #[cfg(feature = "stats")]
        self.queues.count_removal(WakeReason::Signaled, wakeup.woken);
        trace!("sleepq: signal {:?}, woke {}", self.wchan, wakeup.woken);
        wakeup
    }

    /// Wakes every context sleeping on the channel.
    pub fn broadcast(&mut self) -> Wakeup {
        self.broadcast_pri(None)
    }

    /// Like [`broadcast`](Self::broadcast), donating `pri` to every woken
    /// context.
    pub fn broadcast_pri(&mut self, pri: Option<Priority>) -> Wakeup {
        let sched = &self.queues.sched;
        let mut wakeup = Wakeup::default();
        self.bucket
            .remove_all(self.wchan, WakeReason::Broadcast, |entry| {
                wakeup.add(wake(sched, &entry.ctx, pri));
            });
        #[cfg(feature = "stats")]
        self.queues.count_removal(WakeReason::Broadcast, wakeup.woken);
        trace!("sleepq: broadcast {:?}, woke {}", self.wchan, wakeup.woken);
        wakeup
    }

    /// Aborts the interruptible sleep of `ctx` on the channel.
    ///
    /// Returns the residency of the aborted context, or `None` if it was
    /// not in an interruptible sleep here.
    pub fn abort(&mut self, ctx: &S::Context, action: Interrupt) -> Option<Residency> {
        let reason = interrupt_reason(action);
        let found = self.remove_ctx(reason, |entry| entry.interruptible && entry.ctx == *ctx);
        if found.is_some() {
            debug!("sleepq: aborted sleep on {:?} ({reason:?})", self.wchan);
        }
        found
    }

    /// Removes `ctx` from the channel as if it had been signaled.
    pub fn cancel(&mut self, ctx: &S::Context) -> Option<Residency> {
        self.remove_ctx(WakeReason::Signaled, |entry| entry.ctx == *ctx)
    }

    fn remove_ctx(
        &mut self,
        reason: WakeReason,
        pred: impl FnMut(&SleepEntry<S::Context>) -> bool,
    ) -> Option<Residency> {
        let sched = &self.queues.sched;
        let mut residency = None;
        self.bucket.remove_first(self.wchan, reason, pred, |entry| {
            residency = Some(wake(sched, &entry.ctx, None));
        });
        #[cfg(feature = "stats")]
        {
            if residency.is_some() {
                self.queues.count_removal(reason, 1);
            }
        }
        residency
    }

    /// Links `entry` into the bucket.
    ///
    /// # Safety
    ///
    /// `entry` must be on this guard's channel and must not move or drop
    /// until it has been unlinked, which [`park`](Self::park) guarantees.
    pub(crate) unsafe fn enqueue(&mut self, entry: &SleepEntry<S::Context>) {
        debug_assert_eq!(entry.wchan, self.wchan);
        // SAFETY: guaranteed by the caller.
        unsafe { self.bucket.push(entry) };
        self.queues.sched.set_wchan(&entry.ctx, Some(self.wchan));
        #[cfg(feature = "stats")]
        self.queues.counters.sleeps.fetch_add(1, Ordering::Relaxed);
        trace!(
            "sleepq: sleeping on {:?} ({}), depth {}",
            self.wchan,
            entry.description,
            self.bucket.depth()
        );
    }

    /// Drops the guard and suspends until `entry` has been removed, then
    /// returns why.
    ///
    /// A wakeup that lands after the guard is dropped but before the
    /// context suspends is not lost: the entry was already visible, and the
    /// scheduler honours a resume that precedes the suspend. Deadlines are
    /// enforced here, under the guard, so a timeout can never race a
    /// signal into removing the entry twice.
    ///
    /// # Safety
    ///
    /// `entry` must have been enqueued in this bucket.
    pub(crate) unsafe fn park(self, entry: &SleepEntry<S::Context>) -> WakeReason {
        let queues = self.queues;
        let sched = &queues.sched;
        let mut sq = self;
        loop {
            if let Some(reason) = entry.reason() {
                return reason;
            }
            debug_assert!(entry.is_linked());

            let expired = entry.deadline.is_some_and(|d| sched.now() >= d);
            if expired || !sched.is_running() {
                let reason = if expired {
                    WakeReason::TimedOut
                } else {
                    warn!("sleepq: scheduler stopped, leaving {:?}", entry.wchan);
                    WakeReason::Signaled
                };
                sched.set_wchan(&entry.ctx, None);
                // SAFETY: the entry has no reason yet, so it is still linked
                // in this bucket.
                unsafe { sq.bucket.remove(entry, reason) };
                #[cfg(feature = "stats")]
                queues.count_removal(reason, 1);
                return reason;
            }

            drop(sq);
            if let Some(observer) = &queues.observer {
                observer.on_suspend(entry.wchan, entry.description);
            }
            sched.suspend(&entry.ctx, entry.deadline);
            if let Some(observer) = &queues.observer {
                observer.on_resume(entry.wchan, entry.description);
            }
            sq = queues.lock(entry.wchan);
        }
    }
}
