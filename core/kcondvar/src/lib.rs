// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Kernel condition variables on hashed sleep queues.
//!
//! This crate provides the blocking layer under the kernel's higher-level
//! synchronization:
//!
//! - [`SleepQueues`]: the system-wide table of hashed sleep queues, keyed
//!   by [`WaitChannel`]
//! - [`Condvar`]: a condition variable whose waiters sleep on that table
//! - [`WaitLock`]: the locks a wait can release and reacquire, with
//!   [`SpinMutex`], [`SleepLock`], [`Giant`] and [`NoLock`] provided
//!
//! The scheduler is an external collaborator reached through the
//! [`Scheduler`] trait.
//!
//! # Examples
//!
//! ```no_run
//! use kcondvar::{Condvar, Scheduler, SpinMutex};
//!
//! fn consumer<S: Scheduler>(ready: &SpinMutex<bool>, cv: &Condvar<'_, S>) {
//!     let mut guard = ready.lock();
//!     cv.wait_while(&mut guard, |ready| !*ready);
//!     // `guard` is held and `*guard` is true here
//! }
//!
//! fn producer<S: Scheduler>(ready: &SpinMutex<bool>, cv: &Condvar<'_, S>) {
//!     *ready.lock() = true;
//!     cv.signal();
//! }
//! ```
//!
//! # Features
//!
//! - `smp`: Atomic bucket guards for multi-core systems
//! - `stats`: Enable sleep queue statistics (sleeps, wakeups, timeouts,
//!   interruptions, deepest bucket)

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
extern crate alloc;

mod condvar;
mod config;
mod error;
mod lock;
mod sched;
mod sleepq;
mod util;

#[cfg(feature = "stats")]
pub use self::sleepq::SleepQueueStats;
pub use self::{
    condvar::Condvar,
    config::{MAX_BUCKETS, SleepQueueConfig},
    error::{ConfigError, WaitError},
    lock::{
        Giant, GiantGuard, LockClass, NoLock, SleepLock, SleepLockGuard, SpinMutex,
        SpinMutexGuard, WaitLock,
    },
    sched::{Interrupt, Priority, Residency, Scheduler, WaitObserver},
    sleepq::{SleepQueueGuard, SleepQueues, WaitChannel, WakeReason, Wakeup},
    util::SpinConfig,
};
