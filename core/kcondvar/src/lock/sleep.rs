//! A sleepable exclusive lock built on the sleep queues.

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

use super::{NoLock, WaitLock};
use crate::{
    sched::Scheduler,
    sleepq::{SleepMode, SleepQueues, WaitChannel},
    util::{Spin, SpinConfig},
};

/// Set in the owner word while contexts sleep on the lock.
const CONTESTED: u64 = 1 << 63;

/// An exclusive lock whose contenders sleep instead of spinning.
///
/// Contenders first spin for a while, as configured by [`SpinConfig`],
/// then queue on the lock's own wait channel. Because acquiring it may
/// sleep, it is a sleepable lock for the purposes of [`WaitLock`].
pub struct SleepLock<'q, S: Scheduler, T: ?Sized> {
    queues: &'q SleepQueues<S>,
    owner_id: AtomicU64,
    config: SpinConfig,
    description: &'static str,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<S: Scheduler, T: ?Sized + Send> Sync for SleepLock<'_, S, T> {}
unsafe impl<S: Scheduler, T: ?Sized + Send> Send for SleepLock<'_, S, T> {}

impl<'q, S: Scheduler, T> SleepLock<'q, S, T> {
    /// Creates an unlocked lock with the default spin configuration.
    pub const fn new(queues: &'q SleepQueues<S>, description: &'static str, data: T) -> Self {
        Self::with_config(queues, SpinConfig::DEFAULT, description, data)
    }

    /// Creates an unlocked lock with a custom spin configuration.
    pub const fn with_config(
        queues: &'q SleepQueues<S>,
        config: SpinConfig,
        description: &'static str,
        data: T,
    ) -> Self {
        Self {
            queues,
            owner_id: AtomicU64::new(0),
            config,
            description,
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock and returns the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<'q, S: Scheduler, T: ?Sized> SleepLock<'q, S, T> {
    /// Acquires the lock, sleeping until it is available.
    ///
    /// # Panics
    ///
    /// Panics if the calling context already owns the lock.
    pub fn lock(&self) -> SleepLockGuard<'_, 'q, S, T> {
        self.acquire();
        SleepLockGuard { lock: self }
    }

    /// Tries to acquire the lock without sleeping.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, 'q, S, T>> {
        let current_id = self.current_id();
        // The reason for using a strong compare_exchange is explained here:
        // https://github.com/Amanieu/parking_lot/pull/207#issuecomment-575869107
        self.owner_id
            .compare_exchange(0, current_id, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SleepLockGuard { lock: self })
    }

    /// Returns whether some context holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner_id.load(Ordering::Relaxed) != 0
    }

    /// Returns the lock's description.
    #[inline]
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Gets a mutable reference without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    fn wchan(&self) -> WaitChannel {
        WaitChannel::of(self)
    }

    fn current_id(&self) -> u64 {
        let sched = self.queues.scheduler();
        let id = sched.context_id(&sched.current());
        assert!(
            id != 0 && id & CONTESTED == 0,
            "context id {id:#x} cannot own a sleep lock"
        );
        id
    }

    fn acquire(&self) {
        let sched = self.queues.scheduler();
        let current_id = self.current_id();
        let mut spin = Spin::new(self.config);
        let mut owner_id = self.owner_id.load(Ordering::Relaxed);

        loop {
            assert_ne!(
                owner_id & !CONTESTED,
                current_id,
                "{} tried to acquire sleep lock it already owns.",
                self.description
            );

            if owner_id == 0 {
                match self.owner_id.compare_exchange_weak(
                    0,
                    current_id,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(x) => owner_id = x,
                }
                continue;
            }

            if spin.spin(sched) {
                owner_id = self.owner_id.load(Ordering::Relaxed);
                continue;
            }

            // Mark the lock contested under the bucket guard, so the owner's
            // release cannot slip between the check and the enqueue.
            let sq = self.queues.lock(self.wchan());
            owner_id = self.owner_id.load(Ordering::Relaxed);
            if owner_id == 0 {
                continue;
            }
            if owner_id & CONTESTED == 0 {
                if let Err(x) = self.owner_id.compare_exchange(
                    owner_id,
                    owner_id | CONTESTED,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    owner_id = x;
                    continue;
                }
            }

            let mode = SleepMode {
                interruptible: false,
                timeout: None,
                description: self.description,
            };
            // Uninterruptible and untimed, so the only outcome is a wakeup.
            let _ = self.queues.sleep(sq, None, &mut NoLock, mode, true);
            spin.reset();
            owner_id = self.owner_id.load(Ordering::Relaxed);
        }
    }

    fn release(&self) {
        let current_id = self.current_id();
        let owner_id = self.owner_id.swap(0, Ordering::Release);
        assert_eq!(
            owner_id & !CONTESTED,
            current_id,
            "{} tried to release sleep lock it doesn't own",
            self.description
        );
        if owner_id & CONTESTED != 0 {
            // Every sleeper retries; the losers mark the lock contested again.
            self.queues.broadcast(self.wchan());
        }
    }
}

impl<S: Scheduler, T: ?Sized + fmt::Debug> fmt::Debug for SleepLock<'_, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f
                .debug_struct("SleepLock")
                .field("data", &&*guard)
                .finish(),
            None => f
                .debug_struct("SleepLock")
                .field("data", &"<locked>")
                .finish(),
        }
    }
}

/// RAII guard for [`SleepLock`].
pub struct SleepLockGuard<'a, 'q, S: Scheduler, T: ?Sized> {
    lock: &'a SleepLock<'q, S, T>,
}

impl<S: Scheduler, T: ?Sized> Deref for SleepLockGuard<'_, '_, S, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<S: Scheduler, T: ?Sized> DerefMut for SleepLockGuard<'_, '_, S, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<S: Scheduler, T: ?Sized> Drop for SleepLockGuard<'_, '_, S, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<S: Scheduler, T: ?Sized> WaitLock for SleepLockGuard<'_, '_, S, T> {
    type State = ();

    fn is_sleepable(&self) -> bool {
        true
    }

    fn release(&mut self) {
        self.lock.release();
    }

    fn reacquire(&mut self, _state: ()) {
        self.lock.acquire();
    }
}
