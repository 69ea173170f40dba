//! Interfaces consumed from the scheduler and tracing layers.

use core::time::Duration;

use crate::sleepq::WaitChannel;

/// A scheduling priority donated to a woken context. Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

/// Whether a woken context's memory is in fast storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// The context can run as soon as it is picked.
    Resident,
    /// The context was swapped out; the swapper must bring it back.
    Swapped,
}

/// How a pending asynchronous signal wants an interruptible wait to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Fail the blocked operation outward.
    Fail,
    /// Restart the blocked operation from the top.
    Restart,
}

/// The scheduler as seen by the sleep queues.
///
/// Implementations own the run-queues, priority inheritance and the
/// swapper. The sleep queues only ask them to suspend the current context
/// and to make a given context runnable again.
///
/// # Wakeup contract
///
/// [`suspend`](Self::suspend) is entered after the bucket guard has been
/// dropped. A [`resume`](Self::resume) for the same context that lands
/// between that drop and the suspend must make the suspend return
/// immediately (a wakeup permit, like `std::thread::park`). Spurious
/// returns are allowed; the sleep queues re-check under the bucket guard.
pub trait Scheduler: Sync {
    /// Handle naming one execution context.
    type Context: Clone + PartialEq + Send + Sync;

    /// Returns the handle of the calling context.
    fn current(&self) -> Self::Context;

    /// Returns a non-zero identifier unique among live contexts.
    fn context_id(&self, ctx: &Self::Context) -> u64;

    /// Returns `false` before the scheduler is up or after a fatal stop.
    ///
    /// While this is `false`, waits return at once instead of suspending.
    fn is_running(&self) -> bool {
        true
    }

    /// Monotonic time since boot.
    fn now(&self) -> Duration;

    /// Suspends the calling context (`ctx`) until it is resumed or the
    /// absolute `deadline` passes.
    fn suspend(&self, ctx: &Self::Context, deadline: Option<Duration>);

    /// Marks `ctx` runnable, optionally donating `pri`.
    ///
    /// Called with a bucket guard held, so it must not block.
    fn resume(&self, ctx: &Self::Context, pri: Option<Priority>) -> Residency;

    /// Wakes the swapper after a batch of wakeups found a swapped context.
    fn kick_swapper(&self) {}

    /// Returns the action of a signal pending for `ctx`, if any.
    fn pending_interrupt(&self, _ctx: &Self::Context) -> Option<Interrupt> {
        None
    }

    /// Records the channel `ctx` sleeps on, `None` once it has left it.
    ///
    /// Called with the bucket guard held, right after the context is queued
    /// and whenever it is removed, so it must not block. Schedulers that
    /// deliver signals by context alone keep the value for
    /// [`wchan`](Self::wchan).
    fn set_wchan(&self, _ctx: &Self::Context, _wchan: Option<WaitChannel>) {}

    /// Returns the channel last recorded by [`set_wchan`](Self::set_wchan).
    ///
    /// Must be ordered after [`pending_interrupt`](Self::pending_interrupt)
    /// for the same context: a signal posted before this read is either
    /// seen by the sleeper before it queues, or the read finds the channel.
    fn wchan(&self, _ctx: &Self::Context) -> Option<WaitChannel> {
        None
    }

    /// Gives up the CPU during adaptive spinning.
    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

/// Optional tracing hooks run around every suspension.
pub trait WaitObserver: Send + Sync {
    /// Called right before the context suspends on `wchan`.
    fn on_suspend(&self, wchan: WaitChannel, description: &'static str);

    /// Called right after the context returns from suspension.
    fn on_resume(&self, wchan: WaitChannel, description: &'static str);
}
