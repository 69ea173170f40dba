#![allow(dead_code)]

use std::{
    cell::Cell,
    collections::{HashMap, HashSet},
    sync::{
        Mutex, Once,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, Thread},
    time::{Duration, Instant},
};

use kcondvar::{Condvar, Interrupt, Priority, Residency, Scheduler, SleepQueues, WaitChannel};

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn may_interrupt() {
    // simulate interrupts
    if fastrand::u8(0..3) == 0 {
        thread::yield_now();
    }
}

/// A std thread seen as a kernel context.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub id: u64,
    thread: Thread,
}

impl PartialEq for Ctx {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CTX_ID: Cell<u64> = const { Cell::new(0) };
}

/// Returns the calling thread's context; ids are assigned on first use.
pub fn current() -> Ctx {
    let id = CTX_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    });
    Ctx {
        id,
        thread: thread::current(),
    }
}

/// Pending signals and recorded channels, under one lock so a posted
/// signal and a channel lookup are totally ordered.
#[derive(Default)]
struct Signals {
    pending: HashMap<u64, Interrupt>,
    wchans: HashMap<u64, WaitChannel>,
}

/// Runs every context as a host thread; suspension is `thread::park`.
pub struct ThreadScheduler {
    start: Instant,
    running: AtomicBool,
    swapped: Mutex<HashSet<u64>>,
    signals: Mutex<Signals>,
    donated: Mutex<Vec<(u64, Priority)>>,
    kicks: AtomicUsize,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            running: AtomicBool::new(true),
            swapped: Mutex::new(HashSet::new()),
            signals: Mutex::new(Signals::default()),
            donated: Mutex::new(Vec::new()),
            kicks: AtomicUsize::new(0),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Reports `ctx` as swapped out from now on.
    pub fn swap_out(&self, ctx: &Ctx) {
        self.swapped.lock().unwrap().insert(ctx.id);
    }

    /// Posts a signal that interruptible waits of `ctx` will see.
    pub fn post_interrupt(&self, ctx: &Ctx, action: Interrupt) {
        self.signals.lock().unwrap().pending.insert(ctx.id, action);
    }

    pub fn swapper_kicks(&self) -> usize {
        self.kicks.load(Ordering::SeqCst)
    }

    pub fn donated(&self) -> Vec<(u64, Priority)> {
        self.donated.lock().unwrap().clone()
    }
}

impl Scheduler for ThreadScheduler {
    type Context = Ctx;

    fn current(&self) -> Ctx {
        current()
    }

    fn context_id(&self, ctx: &Ctx) -> u64 {
        ctx.id
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn suspend(&self, _ctx: &Ctx, deadline: Option<Duration>) {
        match deadline {
            None => thread::park(),
            Some(deadline) => {
                let now = self.now();
                if deadline > now {
                    thread::park_timeout(deadline - now);
                }
            }
        }
    }

    fn resume(&self, ctx: &Ctx, pri: Option<Priority>) -> Residency {
        if let Some(pri) = pri {
            self.donated.lock().unwrap().push((ctx.id, pri));
        }
        ctx.thread.unpark();
        if self.swapped.lock().unwrap().contains(&ctx.id) {
            Residency::Swapped
        } else {
            Residency::Resident
        }
    }

    fn kick_swapper(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }

    fn pending_interrupt(&self, ctx: &Ctx) -> Option<Interrupt> {
        self.signals.lock().unwrap().pending.get(&ctx.id).copied()
    }

    fn set_wchan(&self, ctx: &Ctx, wchan: Option<WaitChannel>) {
        let mut signals = self.signals.lock().unwrap();
        match wchan {
            Some(wchan) => signals.wchans.insert(ctx.id, wchan),
            None => signals.wchans.remove(&ctx.id),
        };
    }

    fn wchan(&self, ctx: &Ctx) -> Option<WaitChannel> {
        self.signals.lock().unwrap().wchans.get(&ctx.id).copied()
    }

    fn yield_now(&self) {
        thread::yield_now();
    }
}

/// A fresh table per test, so scheduler state never leaks between tests.
pub fn queues() -> &'static SleepQueues<ThreadScheduler> {
    init_logger();
    Box::leak(Box::new(SleepQueues::new(ThreadScheduler::new())))
}

/// Spins until `n` contexts wait on `cv`.
pub fn wait_for_waiters(cv: &Condvar<'_, ThreadScheduler>, n: usize) {
    let start = Instant::now();
    while cv.waiters() != n {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "{} never reached {n} waiters",
            cv.description()
        );
        thread::sleep(Duration::from_millis(1));
    }
}
