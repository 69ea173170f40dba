//! Locks a context can hold across a wait.
//!
//! The sleep queues never name a concrete lock type. A wait takes the
//! caller's guard as a [`WaitLock`], releases it once the context is
//! visible to wakers and takes it back after waking.
//!
//! # Release ordering
//!
//! A non-sleepable lock is released while the bucket guard is still held,
//! right before the suspend point. A sleepable lock may block when it is
//! taken back, so the bucket guard is dropped before the lock is released
//! and reacquired after.

use lock_api::RawMutex as _;

mod giant;
mod sleep;

pub use self::{
    giant::{Giant, GiantGuard},
    sleep::{SleepLock, SleepLockGuard},
};

/// A held lock that a wait can release and take back.
pub trait WaitLock {
    /// Whatever [`reacquire`](Self::reacquire) needs to restore the lock
    /// exactly as it was, such as a recursion depth.
    type State;

    /// Whether taking the lock can itself put the context to sleep.
    fn is_sleepable(&self) -> bool;

    /// Releases the lock.
    fn release(&mut self) -> Self::State;

    /// Takes the lock back after [`release`](Self::release).
    fn reacquire(&mut self, state: Self::State);
}

/// Static properties of a raw lock type used through [`lock_api`].
pub trait LockClass {
    /// Whether acquiring the lock may block the context.
    const SLEEPABLE: bool;
}

impl<R: spin::RelaxStrategy> LockClass for spin::mutex::SpinMutex<(), R> {
    const SLEEPABLE: bool = false;
}

/// A spinning mutex; holders must not sleep except through a wait.
pub type SpinMutex<T> = lock_api::Mutex<spin::mutex::SpinMutex<()>, T>;
/// Guard for [`SpinMutex`].
pub type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, spin::mutex::SpinMutex<()>, T>;

impl<R, T> WaitLock for lock_api::MutexGuard<'_, R, T>
where
    R: lock_api::RawMutex + LockClass,
    T: ?Sized,
{
    type State = ();

    fn is_sleepable(&self) -> bool {
        R::SLEEPABLE
    }

    fn release(&mut self) {
        let mutex = lock_api::MutexGuard::mutex(self);
        // SAFETY: the guard proves the lock is held, and the wait keeps the
        // guard borrowed until `reacquire` has run.
        unsafe { mutex.force_unlock() }
    }

    fn reacquire(&mut self, _state: ()) {
        let mutex = lock_api::MutexGuard::mutex(self);
        // SAFETY: locking through the raw handle re-establishes what the
        // guard asserts.
        unsafe { mutex.raw() }.lock();
    }
}

/// Waits without any interlock.
///
/// The caller must close the lost-wakeup window itself, for example by
/// checking its condition under the bucket guard as
/// [`SleepLock`] does.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl WaitLock for NoLock {
    type State = ();

    fn is_sleepable(&self) -> bool {
        false
    }

    fn release(&mut self) {}

    fn reacquire(&mut self, _state: ()) {}
}
