// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Passive-wait channels.
//!
//! These are the only primitives in the runtime that put an OS thread to
//! sleep. Two shapes exist:
//!
//! - [`ParkGroup`]: a 32-bit counter any number of threads can sleep on.
//!   Sleeping is "wait while the value is unchanged" and [`broadcast`]
//!   changes the value before waking, so a wakeup between the value read and
//!   the sleep is observed as a non-sleep (no lost wakeups). There is no way
//!   to wake a single sleeper; woken threads re-check their own condition.
//! - [`ParkCell`]: a one-shot single-waiter handoff used for joining from
//!   outside the runtime (and for tasklet joiners).
//!
//! On Linux both are backed by the futex syscall; elsewhere (and under loom)
//! by an OS mutex + condvar.
//!
//! [`broadcast`]: ParkGroup::broadcast

use crate::spin::RawSpinlock;
use cfg_if::cfg_if;
use core::time::Duration;

cfg_if! {
    if #[cfg(all(target_os = "linux", not(loom)))] {
        use core::sync::atomic::{AtomicU32, Ordering};

        fn futex_wait(val: &AtomicU32, expected: u32, timeout: Option<Duration>) {
            let ts = timeout.map(|dt| libc::timespec {
                tv_sec: i64::try_from(dt.as_secs()).unwrap_or(i64::MAX),
                tv_nsec: i64::from(dt.subsec_nanos()),
            });
            let ts_ptr = ts
                .as_ref()
                .map_or(core::ptr::null(), core::ptr::from_ref);
            // Safety: the futex word outlives the call; a relative timespec
            // (or null) is what FUTEX_WAIT expects.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    val.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    expected,
                    ts_ptr,
                    0usize,
                    0u32,
                );
            }
        }

        fn futex_wake(val: &AtomicU32, count: i32) {
            // Safety: waking is valid for any address; see the module docs
            // for why a stale address here is tolerable.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    val.as_ptr(),
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    count,
                    0usize,
                    0usize,
                    0u32,
                );
            }
        }

        /// Multi-waiter passive-wait channel (futex shape).
        #[derive(Debug)]
        pub(crate) struct ParkGroup {
            val: AtomicU32,
        }

        impl ParkGroup {
            pub(crate) const fn new() -> Self {
                Self { val: AtomicU32::new(0) }
            }

            /// Release `lock` and sleep until the value changes.
            ///
            /// Returns unlocked. The value is sampled before the lock is
            /// released, so a broadcast ordered after the caller's state
            /// change cannot be missed.
            pub(crate) fn wait_and_unlock(&self, lock: &RawSpinlock) {
                let original = self.val.load(Ordering::Relaxed);
                lock.release();
                loop {
                    futex_wait(&self.val, original, None);
                    if self.val.load(Ordering::Relaxed) != original {
                        break;
                    }
                }
            }

            /// As [`wait_and_unlock`](Self::wait_and_unlock) but sleeps at
            /// most `timeout`; may also return spuriously early.
            pub(crate) fn wait_timed_and_unlock(&self, lock: &RawSpinlock, timeout: Duration) {
                let original = self.val.load(Ordering::Relaxed);
                lock.release();
                futex_wait(&self.val, original, Some(timeout));
            }

            /// Bump the value and wake every sleeper.
            pub(crate) fn broadcast(&self) {
                let current = self.val.load(Ordering::Relaxed);
                self.val.store(current.wrapping_add(1), Ordering::Relaxed);
                futex_wake(&self.val, i32::MAX);
            }
        }

        /// Single-waiter handoff (futex shape). The wake-up signal is 1.
        #[derive(Debug)]
        #[repr(align(8))]
        pub(crate) struct ParkCell {
            val: AtomicU32,
        }

        impl ParkCell {
            pub(crate) const fn new() -> Self {
                Self { val: AtomicU32::new(0) }
            }

            /// Sleep until [`resume`](Self::resume) is called. Returns
            /// immediately if it already was.
            pub(crate) fn wait(&self) {
                while self.val.load(Ordering::Acquire) == 0 {
                    futex_wait(&self.val, 0, None);
                }
            }

            pub(crate) fn resume(&self) {
                debug_assert_eq!(self.val.load(Ordering::Relaxed), 0);
                self.val.store(1, Ordering::Release);
                futex_wake(&self.val, 1);
            }
        }
    } else {
        use crate::loom::loom_const_fn;
        use crate::loom::sync::{Condvar, Mutex};

        /// Multi-waiter passive-wait channel (mutex + condvar fallback).
        ///
        /// The counter lives under the OS mutex; a sleeper takes the mutex
        /// *before* releasing the caller's lock, so a broadcast ordered after
        /// the caller's state change either sees the sleeper on the condvar
        /// or has already bumped the value the sleeper will compare against.
        #[derive(Debug)]
        pub(crate) struct ParkGroup {
            val: Mutex<u32>,
            cond: Condvar,
        }

        impl ParkGroup {
            loom_const_fn! {
                pub(crate) const fn new() -> ParkGroup {
                    ParkGroup {
                        val: Mutex::new(0),
                        cond: Condvar::new(),
                    }
                }
            }

            pub(crate) fn wait_and_unlock(&self, lock: &RawSpinlock) {
                let mut guard = self.val.lock().unwrap();
                let original = *guard;
                lock.release();
                while *guard == original {
                    guard = self.cond.wait(guard).unwrap();
                }
            }

            #[cfg(not(loom))]
            pub(crate) fn wait_timed_and_unlock(&self, lock: &RawSpinlock, timeout: Duration) {
                let guard = self.val.lock().unwrap();
                let original = *guard;
                lock.release();
                let _unused = self
                    .cond
                    .wait_timeout_while(guard, timeout, |val| *val == original)
                    .unwrap();
            }

            // Loom's condvar has no timed wait; model runs only exercise the
            // untimed paths.
            #[cfg(loom)]
            pub(crate) fn wait_timed_and_unlock(&self, lock: &RawSpinlock, _timeout: Duration) {
                self.wait_and_unlock(lock);
            }

            pub(crate) fn broadcast(&self) {
                let mut guard = self.val.lock().unwrap();
                *guard = guard.wrapping_add(1);
                self.cond.notify_all();
            }
        }

        /// Single-waiter handoff (mutex + condvar fallback).
        #[derive(Debug)]
        #[repr(align(8))]
        pub(crate) struct ParkCell {
            val: Mutex<bool>,
            cond: Condvar,
        }

        impl ParkCell {
            loom_const_fn! {
                pub(crate) const fn new() -> ParkCell {
                    ParkCell {
                        val: Mutex::new(false),
                        cond: Condvar::new(),
                    }
                }
            }

            pub(crate) fn wait(&self) {
                let mut guard = self.val.lock().unwrap();
                while !*guard {
                    guard = self.cond.wait(guard).unwrap();
                }
            }

            pub(crate) fn resume(&self) {
                let mut guard = self.val.lock().unwrap();
                *guard = true;
                self.cond.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::thread;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn cell_handoff() {
        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref WOKEN: AtomicBool = AtomicBool::new(false);
            }
            let cell = Arc::new(ParkCell::new());

            let waiter = {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    cell.wait();
                    WOKEN.store(true, Ordering::Release);
                })
            };
            cell.resume();
            waiter.join().unwrap();
            assert!(WOKEN.load(Ordering::Acquire));
        });
    }

    #[test]
    fn cell_resume_before_wait() {
        let cell = ParkCell::new();
        cell.resume();
        // Must not block.
        cell.wait();
    }

    #[cfg(not(loom))]
    #[test]
    fn group_broadcast_wakes_sleeper() {
        let group = Arc::new(ParkGroup::new());
        let lock = Arc::new(RawSpinlock::new());
        let woken = Arc::new(AtomicBool::new(false));

        let sleeper = {
            let group = Arc::clone(&group);
            let lock = Arc::clone(&lock);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                lock.acquire();
                group.wait_and_unlock(&lock);
                woken.store(true, Ordering::Release);
            })
        };

        while !lock.is_locked() && !woken.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        group.broadcast();
        // A single broadcast may race the sleeper's registration; keep
        // broadcasting until it reports back.
        while !woken.load(Ordering::Acquire) {
            std::thread::yield_now();
            group.broadcast();
        }
        sleeper.join().unwrap();
    }

    #[cfg(not(loom))]
    #[test]
    fn group_timed_wait_expires() {
        let group = ParkGroup::new();
        let lock = RawSpinlock::new();
        lock.acquire();
        let start = std::time::Instant::now();
        group.wait_timed_and_unlock(&lock, Duration::from_millis(10));
        assert!(!lock.is_locked());
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
