mod common;

use std::thread;

use common::{ThreadScheduler, init_logger, wait_for_waiters};
use kcondvar::{Condvar, ConfigError, SleepQueueConfig, SleepQueues, SpinMutex};

fn single_bucket() -> &'static SleepQueues<ThreadScheduler> {
    init_logger();
    let config = SleepQueueConfig {
        buckets: 1,
        hash_shift: 0,
    };
    let queues = SleepQueues::with_config(ThreadScheduler::new(), config).unwrap();
    Box::leak(Box::new(queues))
}

#[test]
fn sleepq_rejects_bad_config() {
    let config = SleepQueueConfig {
        buckets: 256,
        hash_shift: usize::BITS,
    };
    assert!(matches!(
        SleepQueues::with_config(ThreadScheduler::new(), config),
        Err(ConfigError::BadHashShift(_))
    ));
    assert_eq!(SleepQueueConfig::default().validate(), Ok(()));
}

#[test]
fn sleepq_shared_bucket_keeps_channels_apart() {
    let queues = single_bucket();
    let (cv_a, cv_b) = (Condvar::new(queues, "a"), Condvar::new(queues, "b"));
    let m = &SpinMutex::new(());

    thread::scope(|s| {
        for cv in [&cv_a, &cv_a, &cv_b] {
            s.spawn(move || {
                let mut g = m.lock();
                cv.wait(&mut g);
            });
        }
        wait_for_waiters(&cv_a, 2);
        wait_for_waiters(&cv_b, 1);

        {
            let sq = queues.lock(cv_a.wchan());
            assert_eq!(sq.bucket_depth(), 3);
            assert_eq!(sq.sleep_count(), 2);
        }

        assert_eq!(cv_b.broadcast().woken, 1);
        assert_eq!(cv_a.waiters(), 2);
        assert_eq!(queues.sleep_count(cv_b.wchan()), 0);
        assert_eq!(queues.signal(cv_a.wchan()).woken, 1);
        assert_eq!(cv_a.waiters(), 1);
        assert_eq!(queues.broadcast(cv_a.wchan()).woken, 1);
    });

    assert_eq!(queues.lock(cv_a.wchan()).bucket_depth(), 0);
    cv_a.destroy();
    cv_b.destroy();
}

#[test]
#[cfg(feature = "stats")]
fn sleepq_stats() {
    use std::time::Duration;

    use kcondvar::WaitError;

    let queues = single_bucket();
    let cv = Condvar::new(queues, "stats");
    let m = SpinMutex::new(());

    let mut g = m.lock();
    assert_eq!(
        cv.wait_timeout(&mut g, Duration::from_millis(1)),
        Err(WaitError::TimedOut)
    );
    drop(g);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let mut g = m.lock();
                cv.wait(&mut g);
            });
        }
        wait_for_waiters(&cv, 2);
        cv.signal();
        cv.broadcast();
    });

    let stats = queues.stats();
    assert_eq!(stats.sleeps, 3);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.signaled, 1);
    assert_eq!(stats.broadcast, 1);
    assert_eq!(stats.interrupted, 0);
    assert_eq!(stats.max_depth, 2);
}
