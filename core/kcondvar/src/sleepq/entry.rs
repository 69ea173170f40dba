//! Sleep queue entries and the buckets that link them.

use core::{
    ptr,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
    time::Duration,
};

use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};

use super::WaitChannel;
use crate::error::WaitError;

/// Why an entry left its sleep queue.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken by a signal, or cancelled, which resumes it the same way.
    Signaled = 1,
    /// Woken by a broadcast.
    Broadcast = 2,
    /// The deadline passed first.
    TimedOut = 3,
    /// Aborted by a signal that fails the operation.
    Interrupted = 4,
    /// Aborted by a signal that restarts the operation.
    Restart = 5,
}

impl WakeReason {
    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Signaled),
            2 => Some(Self::Broadcast),
            3 => Some(Self::TimedOut),
            4 => Some(Self::Interrupted),
            5 => Some(Self::Restart),
            _ => None,
        }
    }

    /// Maps the reason to the status a waiter returns.
    pub const fn into_result(self) -> Result<(), WaitError> {
        match self {
            Self::Signaled | Self::Broadcast => Ok(()),
            Self::TimedOut => Err(WaitError::TimedOut),
            Self::Interrupted => Err(WaitError::Interrupted),
            Self::Restart => Err(WaitError::Restart),
        }
    }
}

/// One blocked context.
///
/// Entries live on the sleeping context's stack. Every field except the
/// link and the reason is immutable once the entry is built; the link and
/// the reason change only under the owning bucket's guard.
pub(crate) struct SleepEntry<C> {
    link: LinkedListLink,
    pub(crate) wchan: WaitChannel,
    pub(crate) ctx: C,
    pub(crate) interruptible: bool,
    pub(crate) deadline: Option<Duration>,
    pub(crate) description: &'static str,
    waiters: *const AtomicUsize,
    reason: AtomicU8,
}

intrusive_adapter!(pub(crate) EntryAdapter<C> = UnsafeRef<SleepEntry<C>>: SleepEntry<C> { link: LinkedListLink });

impl<C> SleepEntry<C> {
    pub(crate) fn new(
        wchan: WaitChannel,
        ctx: C,
        interruptible: bool,
        deadline: Option<Duration>,
        waiters: Option<&AtomicUsize>,
        description: &'static str,
    ) -> Self {
        Self {
            link: LinkedListLink::new(),
            wchan,
            ctx,
            interruptible,
            deadline,
            description,
            waiters: waiters.map_or(ptr::null(), |w| w as *const _),
            reason: AtomicU8::new(0),
        }
    }

    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.link.is_linked()
    }

    /// Returns the removal reason, or `None` while still queued.
    #[inline]
    pub(crate) fn reason(&self) -> Option<WakeReason> {
        WakeReason::from_raw(self.reason.load(Ordering::Acquire))
    }

    /// Records the removal. The caller has just unlinked the entry under
    /// its bucket guard.
    fn complete(&self, reason: WakeReason) {
        debug_assert!(self.reason().is_none(), "sleep entry removed twice");
        // SAFETY: the counter belongs to an object that cannot go away while
        // one of its waiters is still inside the wait call.
        if let Some(waiters) = unsafe { self.waiters.as_ref() } {
            let prev = waiters.fetch_sub(1, Ordering::Relaxed);
            assert_ne!(prev, 0, "waiter count underflow on {:?}", self.wchan);
        }
        self.reason.store(reason as u8, Ordering::Release);
    }
}

/// The entries of every channel that hashes to one slot.
pub(crate) struct Bucket<C> {
    list: LinkedList<EntryAdapter<C>>,
    depth: usize,
    max_depth: usize,
}

// SAFETY: the list only holds pointers to entries whose owners are parked
// inside a wait call, and it is only touched under the bucket guard.
unsafe impl<C: Send + Sync> Send for Bucket<C> {}

impl<C> Bucket<C> {
    pub(crate) fn new() -> Self {
        Self {
            list: LinkedList::new(EntryAdapter::new()),
            depth: 0,
            max_depth: 0,
        }
    }

    /// Number of entries on every channel in this bucket.
    #[inline]
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    /// Deepest the bucket has been since creation.
    #[inline]
    pub(crate) fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Links `entry` at the tail and accounts it against its waiter count.
    ///
    /// # Safety
    ///
    /// `entry` must stay in place until it has been unlinked again.
    pub(crate) unsafe fn push(&mut self, entry: &SleepEntry<C>) {
        assert!(!entry.is_linked(), "sleep entry enqueued twice");
        // SAFETY: the waiter count outlives the entry, see `complete`.
        if let Some(waiters) = unsafe { entry.waiters.as_ref() } {
            waiters.fetch_add(1, Ordering::Relaxed);
        }
        // SAFETY: guaranteed by the caller.
        self.list
            .push_back(unsafe { UnsafeRef::from_raw(entry as *const _) });
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
    }

    /// Unlinks `entry` and records `reason`.
    ///
    /// # Safety
    ///
    /// `entry` must be linked in this bucket.
    pub(crate) unsafe fn remove(&mut self, entry: &SleepEntry<C>, reason: WakeReason) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.list.cursor_mut_from_ptr(entry as *const _) }.remove();
        self.depth -= 1;
        entry.complete(reason);
    }

    /// Unlinks the earliest entry on `wchan` accepted by `pred`, records
    /// `reason` and hands it to `wake`.
    pub(crate) fn remove_first(
        &mut self,
        wchan: WaitChannel,
        reason: WakeReason,
        mut pred: impl FnMut(&SleepEntry<C>) -> bool,
        wake: impl FnOnce(&SleepEntry<C>),
    ) -> bool {
        let mut cursor = self.list.front_mut();
        loop {
            let hit = match cursor.get() {
                None => return false,
                Some(entry) => entry.wchan == wchan && pred(entry),
            };
            if hit {
                break;
            }
            cursor.move_next();
        }
        let Some(entry) = cursor.remove() else {
            return false;
        };
        self.depth -= 1;
        entry.complete(reason);
        wake(&entry);
        true
    }

    /// Unlinks every entry on `wchan` in queue order, handing each to
    /// `wake`. Returns how many were removed.
    pub(crate) fn remove_all(
        &mut self,
        wchan: WaitChannel,
        reason: WakeReason,
        mut wake: impl FnMut(&SleepEntry<C>),
    ) -> usize {
        let mut removed = 0;
        let mut cursor = self.list.front_mut();
        loop {
            let hit = match cursor.get() {
                None => break,
                Some(entry) => entry.wchan == wchan,
            };
            if !hit {
                cursor.move_next();
                continue;
            }
            if let Some(entry) = cursor.remove() {
                entry.complete(reason);
                wake(&entry);
                removed += 1;
            }
        }
        self.depth -= removed;
        removed
    }

    /// Number of entries queued on `wchan`.
    pub(crate) fn count(&self, wchan: WaitChannel) -> usize {
        self.list.iter().filter(|e| e.wchan == wchan).count()
    }
}
