mod common;

use std::{
    sync::atomic::{AtomicU32, Ordering},
    thread,
    time::Duration,
};

use common::{may_interrupt, queues, wait_for_waiters};
use kcondvar::{Condvar, Giant, SleepLock, SpinConfig, WaitChannel, WaitError, WaitLock};

const NO_SPIN: SpinConfig = SpinConfig {
    max_spins: 0,
    spin_before_yield: 0,
};

#[test]
fn sleep_lock_basic() {
    let queues = queues();
    let m = SleepLock::new(queues, "basic", 0);
    *m.lock() = 42;
    assert_eq!(*m.lock(), 42);
    assert!(!m.is_locked());
    assert_eq!(m.description(), "basic");

    let g = m.lock();
    assert!(m.try_lock().is_none());
    drop(g);
    assert!(m.try_lock().is_some());
    assert_eq!(m.into_inner(), 42);
}

#[test]
fn sleep_lock_concurrent() {
    const NUM_TASKS: u32 = 4;

    let queues = queues();
    // Without spinning every contended acquire sleeps and every release
    // wakes the whole herd, so that pass runs fewer rounds.
    for (config, iters) in [(SpinConfig::default(), 500), (NO_SPIN, 50)] {
        let m = SleepLock::with_config(queues, config, "counter", 0);

        let inc = |delta: u32| {
            for _ in 0..iters {
                let mut val = m.lock();
                *val += delta;
                may_interrupt();
                drop(val);
                may_interrupt();
            }
        };

        thread::scope(|s| {
            for _ in 0..NUM_TASKS {
                s.spawn(|| inc(1));
                s.spawn(|| inc(2));
            }
        });

        assert_eq!(*m.lock(), iters * NUM_TASKS * 3);
        assert_eq!(queues.sleep_count(WaitChannel::of(&m)), 0);
    }
}

#[test]
#[should_panic(expected = "already owns")]
fn sleep_lock_relock_panics() {
    let queues = queues();
    let m = SleepLock::new(queues, "relock", ());
    let _g = m.lock();
    let _g2 = m.lock();
}

#[test]
fn sleep_lock_contender_sleeps() {
    let queues = queues();
    let m = SleepLock::with_config(queues, NO_SPIN, "contended", 0);
    let wchan = WaitChannel::of(&m);

    thread::scope(|s| {
        let mut g = m.lock();
        let contender = s.spawn(|| *m.lock() += 1);
        while queues.sleep_count(wchan) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        *g += 1;
        drop(g);
        contender.join().unwrap();
    });

    assert_eq!(*m.lock(), 2);
    assert_eq!(queues.sleep_count(wchan), 0);
}

#[test]
fn condvar_with_sleep_lock() {
    let queues = queues();
    let cv = Condvar::new(queues, "sleepable");
    let m = SleepLock::new(queues, "state", false);

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let mut ready = m.lock();
            cv.wait_while(&mut ready, |ready| !*ready);
            assert!(m.is_locked());
            assert_eq!(
                cv.wait_timeout(&mut ready, Duration::from_millis(5)),
                Err(WaitError::TimedOut)
            );
            assert!(m.is_locked());
        });

        wait_for_waiters(&cv, 1);
        // The waiter released the lock after queueing.
        *m.lock() = true;
        cv.signal();
        waiter.join().unwrap();
    });

    assert!(!m.is_locked());
    cv.destroy();
}

#[test]
fn giant_is_recursive() {
    let queues = queues();
    let giant = Giant::new(queues.scheduler(), 5);
    assert_eq!(giant.depth(), 0);
    {
        let g1 = giant.lock();
        let g2 = giant.lock();
        assert_eq!(giant.depth(), 2);
        assert_eq!(*g1 + *g2, 10);
        drop(g1);
        assert_eq!(giant.depth(), 1);
    }
    assert!(!giant.is_owned());
}

#[test]
fn giant_release_restores_depth() {
    let queues = queues();
    let giant = Giant::new(queues.scheduler(), ());
    let _g1 = giant.lock();
    let _g2 = giant.lock();
    let mut g3 = giant.lock();
    assert!(!g3.is_sleepable());

    let depth = g3.release();
    assert_eq!(depth, 3);
    assert!(!giant.is_owned());
    g3.reacquire(depth);
    assert_eq!(giant.depth(), 3);
}

#[test]
fn giant_concurrent() {
    const NUM_TASKS: u32 = 8;
    const NUM_ITERS: u32 = 500;

    let queues = queues();
    let giant = Giant::new(queues.scheduler(), AtomicU32::new(0));

    thread::scope(|s| {
        for _ in 0..NUM_TASKS {
            s.spawn(|| {
                for _ in 0..NUM_ITERS {
                    let outer = giant.lock();
                    let inner = giant.lock();
                    // Not atomic as a whole; the lock keeps it exclusive.
                    let val = inner.load(Ordering::Relaxed);
                    may_interrupt();
                    outer.store(val + 1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(giant.lock().load(Ordering::Relaxed), NUM_TASKS * NUM_ITERS);
}

#[test]
fn condvar_with_giant_keeps_depth() {
    let queues = queues();
    let cv = Condvar::new(queues, "legacy");
    let giant = Giant::new(queues.scheduler(), AtomicU32::new(0));

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let _g1 = giant.lock();
            let _g2 = giant.lock();
            let mut g3 = giant.lock();
            cv.wait(&mut g3);
            assert_eq!(giant.depth(), 3);
            assert_eq!(g3.load(Ordering::Relaxed), 1);
        });

        wait_for_waiters(&cv, 1);
        // Every recursion level was dropped for the wait.
        let g = giant.lock();
        assert_eq!(giant.depth(), 1);
        g.store(1, Ordering::Relaxed);
        cv.signal();
        drop(g);
        waiter.join().unwrap();
    });

    assert_eq!(giant.depth(), 0);
}
