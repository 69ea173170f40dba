//! The legacy coarse-grained kernel lock.

use core::{
    fmt,
    ops::Deref,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use super::WaitLock;
use crate::{
    sched::Scheduler,
    util::{Spin, SpinConfig},
};

/// A recursive, non-sleepable lock for code that still serializes on one
/// big lock.
///
/// The owner may lock it again; each guard adds one recursion level. A
/// wait drops every level at once and restores the same depth when it
/// returns, so code deep inside a Giant-holding call chain can block.
pub struct Giant<'s, S: Scheduler, T: ?Sized> {
    sched: &'s S,
    owner_id: AtomicU64,
    depth: AtomicU32,
    config: SpinConfig,
    data: T,
}

impl<'s, S: Scheduler, T> Giant<'s, S, T> {
    /// Creates an unlocked Giant with the default spin configuration.
    pub const fn new(sched: &'s S, data: T) -> Self {
        Self::with_config(sched, SpinConfig::DEFAULT, data)
    }

    /// Creates an unlocked Giant with a custom spin configuration.
    pub const fn with_config(sched: &'s S, config: SpinConfig, data: T) -> Self {
        Self {
            sched,
            owner_id: AtomicU64::new(0),
            depth: AtomicU32::new(0),
            config,
            data,
        }
    }
}

impl<'s, S: Scheduler, T: ?Sized> Giant<'s, S, T> {
    /// Acquires one recursion level, spinning until the lock is free if
    /// another context owns it.
    pub fn lock(&self) -> GiantGuard<'_, 's, S, T> {
        let current_id = self.current_id();
        if self.owner_id.load(Ordering::Relaxed) == current_id {
            self.depth.fetch_add(1, Ordering::Relaxed);
        } else {
            self.acquire(current_id, 1);
        }
        GiantGuard { lock: self }
    }

    /// Returns whether the calling context owns the lock.
    pub fn is_owned(&self) -> bool {
        self.owner_id.load(Ordering::Relaxed) == self.current_id()
    }

    /// Returns the calling context's recursion depth, zero if it does not
    /// own the lock.
    pub fn depth(&self) -> u32 {
        if self.is_owned() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    fn current_id(&self) -> u64 {
        let id = self.sched.context_id(&self.sched.current());
        assert_ne!(id, 0, "context id 0 cannot own Giant");
        id
    }

    fn acquire(&self, current_id: u64, depth: u32) {
        let mut spin = Spin::new(self.config);
        while self
            .owner_id
            .compare_exchange_weak(0, current_id, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.owner_id.load(Ordering::Relaxed) != 0 {
                if !spin.spin(self.sched) {
                    self.sched.yield_now();
                }
            }
        }
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// Drops every recursion level and returns how many there were.
    fn release_all(&self) -> u32 {
        assert!(self.is_owned(), "Giant released by a context that doesn't own it");
        let depth = self.depth.swap(0, Ordering::Relaxed);
        self.owner_id.store(0, Ordering::Release);
        depth
    }

    fn unlock_one(&self) {
        assert!(self.is_owned(), "Giant released by a context that doesn't own it");
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner_id.store(0, Ordering::Release);
        }
    }
}

impl<S: Scheduler, T: ?Sized + fmt::Debug> fmt::Debug for Giant<'_, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Giant")
            .field("owner_id", &self.owner_id.load(Ordering::Relaxed))
            .field("data", &&self.data)
            .finish()
    }
}

/// One recursion level of [`Giant`].
pub struct GiantGuard<'a, 's, S: Scheduler, T: ?Sized> {
    lock: &'a Giant<'s, S, T>,
}

impl<S: Scheduler, T: ?Sized> Deref for GiantGuard<'_, '_, S, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<S: Scheduler, T: ?Sized> Drop for GiantGuard<'_, '_, S, T> {
    fn drop(&mut self) {
        self.lock.unlock_one();
    }
}

impl<S: Scheduler, T: ?Sized> WaitLock for GiantGuard<'_, '_, S, T> {
    type State = u32;

    fn is_sleepable(&self) -> bool {
        false
    }

    fn release(&mut self) -> u32 {
        self.lock.release_all()
    }

    fn reacquire(&mut self, depth: u32) {
        let current_id = self.lock.current_id();
        self.lock.acquire(current_id, depth);
    }
}
