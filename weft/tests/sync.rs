// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization-object and key behavior.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use weft::sync::{Barrier, Condvar, Eventual, Future, Mutex, RwLock, XstreamBarrier};
use weft::{current, Error, Key, Pool, Ult, Xstream};

fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: StdMutex<()> = StdMutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = serial();
    weft::init().unwrap();
    guard
}

fn main_pool() -> Pool {
    current::xstream().unwrap().main_pool().unwrap()
}

#[test]
fn mutex_excludes_and_try_lock_reports_busy() {
    let _guard = setup();
    {
        let mutex = Mutex::new();
        let held = mutex.lock().unwrap();
        assert!(mutex.is_locked());
        assert_eq!(mutex.try_lock().unwrap_err(), Error::LockBusy);
        drop(held);
        let again = mutex.try_lock().unwrap();
        drop(again);
    }
    weft::finalize().unwrap();
}

#[test]
fn recursive_mutex_relocks_for_the_owner() {
    let _guard = setup();
    {
        let mutex = Mutex::new_recursive();
        let outer = mutex.lock().unwrap();
        let inner = mutex.lock().unwrap();
        drop(inner);
        assert!(mutex.is_locked());
        drop(outer);
        assert!(!mutex.is_locked());
    }
    weft::finalize().unwrap();
}

#[test]
fn condvar_signal_wakes_a_waiting_ult() {
    let _guard = setup();
    {
        let mutex = Arc::new(Mutex::new());
        let cond = Arc::new(Condvar::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let mutex = Arc::clone(&mutex);
            let cond = Arc::clone(&cond);
            let flag = Arc::clone(&flag);
            Ult::create(&main_pool(), move || {
                let mut guard = mutex.lock().unwrap();
                while !flag.load(Ordering::Acquire) {
                    guard = cond.wait(guard).unwrap();
                }
                drop(guard);
            })
            .unwrap()
        };

        // Let the waiter block first.
        for _ in 0..4 {
            current::yield_now().unwrap();
        }
        {
            let guard = mutex.lock().unwrap();
            flag.store(true, Ordering::Release);
            drop(guard);
            cond.signal().unwrap();
        }
        waiter.join().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn condvar_timedwait_with_past_deadline_times_out() {
    let _guard = setup();
    {
        let mutex = Mutex::new();
        let cond = Condvar::new();
        let guard = mutex.lock().unwrap();
        let (guard, timed_out) = cond
            .wait_timeout(guard, Instant::now() - Duration::from_millis(1))
            .unwrap();
        assert!(timed_out);
        drop(guard);
    }
    weft::finalize().unwrap();
}

#[test]
fn condvar_timedwait_observes_a_signal() {
    let _guard = setup();
    {
        let mutex = Arc::new(Mutex::new());
        let cond = Arc::new(Condvar::new());
        let result = Arc::new(AtomicBool::new(true));

        let waiter = {
            let mutex = Arc::clone(&mutex);
            let cond = Arc::clone(&cond);
            let result = Arc::clone(&result);
            Ult::create(&main_pool(), move || {
                let guard = mutex.lock().unwrap();
                let (guard, timed_out) = cond
                    .wait_timeout(guard, Instant::now() + Duration::from_secs(5))
                    .unwrap();
                result.store(timed_out, Ordering::Release);
                drop(guard);
            })
            .unwrap()
        };
        for _ in 0..4 {
            current::yield_now().unwrap();
        }
        cond.signal().unwrap();
        waiter.join().unwrap();
        assert!(!result.load(Ordering::Acquire), "signal beat the deadline");
    }
    weft::finalize().unwrap();
}

#[test]
fn rwlock_serializes_writers_against_readers() {
    let _guard = setup();
    {
        let lock = Arc::new(RwLock::new());
        let value = Arc::new(AtomicU32::new(0));

        let writer = {
            let lock = Arc::clone(&lock);
            let value = Arc::clone(&value);
            Ult::create(&main_pool(), move || {
                let _w = lock.write().unwrap();
                value.store(7, Ordering::Release);
            })
            .unwrap()
        };

        let read = lock.read().unwrap();
        // The writer cannot enter while we hold a read lock.
        current::yield_now().unwrap();
        assert_eq!(value.load(Ordering::Acquire), 0);
        drop(read);

        writer.join().unwrap();
        assert_eq!(value.load(Ordering::Acquire), 7);

        let read = lock.read().unwrap();
        drop(read);
    }
    weft::finalize().unwrap();
}

#[test]
fn eventual_wakes_cross_stream_waiters() {
    let _guard = setup();
    {
        let xs = Xstream::create().unwrap();
        let eventual: Arc<Eventual<u32>> = Arc::new(Eventual::new());

        let setter = {
            let eventual = Arc::clone(&eventual);
            Ult::create_on_xstream(&xs, move || {
                std::thread::sleep(Duration::from_millis(20));
                eventual.set(99).unwrap();
            })
            .unwrap()
        };

        eventual.wait().unwrap();
        assert!(eventual.test());
        assert_eq!(eventual.with(|v| v.copied()), Some(99));
        setter.join().unwrap();

        assert_eq!(eventual.reset(), Some(99));
        assert!(!eventual.test());
        xs.free().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn future_completes_after_all_compartments() {
    let _guard = setup();
    {
        let sum = Arc::new(AtomicU32::new(0));
        let future: Arc<Future<u32>> = {
            let sum = Arc::clone(&sum);
            Arc::new(Future::with_callback(
                3,
                Box::new(move |values| {
                    sum.store(values.iter().sum(), Ordering::Release);
                }),
            ))
        };
        assert!(!future.test());

        let contributors: Vec<Ult> = (1..=3)
            .map(|i| {
                let future = Arc::clone(&future);
                Ult::create(&main_pool(), move || {
                    future.set(i).unwrap();
                })
                .unwrap()
            })
            .collect();

        future.wait().unwrap();
        assert!(future.test());
        assert_eq!(sum.load(Ordering::Acquire), 6);
        assert_eq!(future.with(<[u32]>::len), 3);
        for c in contributors {
            c.join().unwrap();
        }

        // Over-filling is rejected.
        assert_eq!(future.set(4).unwrap_err(), Error::InvalidState);
        future.reset().unwrap();
        assert!(!future.test());
    }
    weft::finalize().unwrap();
}

#[test]
fn barrier_releases_all_arrivals_together() {
    let _guard = setup();
    {
        let barrier = Arc::new(Barrier::new(3));
        let passed = Arc::new(AtomicU32::new(0));

        let ults: Vec<Ult> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let passed = Arc::clone(&passed);
                Ult::create(&main_pool(), move || {
                    barrier.wait().unwrap();
                    passed.fetch_add(1, Ordering::Release);
                })
                .unwrap()
            })
            .collect();

        for u in ults {
            u.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::Acquire), 3);
        assert_eq!(barrier.num_waiters(), 3);
        barrier.reinit(2).unwrap();
        assert_eq!(barrier.num_waiters(), 2);
    }
    weft::finalize().unwrap();
}

#[test]
fn xstream_barrier_lines_up_os_threads() {
    let _guard = setup();
    {
        let barrier = Arc::new(XstreamBarrier::new(2));
        let other = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.wait().unwrap())
        };
        barrier.wait().unwrap();
        other.join().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn key_roundtrip_laws() {
    let _guard = setup();
    {
        let key: Key<u32> = Key::new();
        let checks = Arc::new(AtomicU32::new(0));
        let ult = {
            let checks = Arc::clone(&checks);
            Ult::create(&main_pool(), move || {
                // set; get == v
                key.set(10).unwrap();
                assert_eq!(key.with(|v| v.copied()).unwrap(), Some(10));
                // set; set; get == v2
                key.set(20).unwrap();
                assert_eq!(key.with(|v| v.copied()).unwrap(), Some(20));
                // take empties the slot
                assert_eq!(key.take().unwrap(), Some(20));
                assert_eq!(key.with(|v| v.copied()).unwrap(), None);
                checks.fetch_add(1, Ordering::Release);
            })
            .unwrap()
        };
        ult.join().unwrap();
        assert_eq!(checks.load(Ordering::Acquire), 1);

        // Values are per unit: the primary sees its own (empty) slot.
        assert_eq!(key.with(|v| v.copied()).unwrap(), None);
    }
    weft::finalize().unwrap();
}

#[test]
fn key_destructor_runs_at_unit_release() {
    let _guard = setup();
    {
        static DROPS: AtomicU32 = AtomicU32::new(0);
        struct Probe;
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Release);
            }
        }

        let key: Key<Probe> = Key::new();
        let ult = Ult::create(&main_pool(), move || {
            key.set(Probe).unwrap();
        })
        .unwrap();
        ult.join().unwrap();
        assert_eq!(DROPS.load(Ordering::Acquire), 0, "join must not run destructors");
        ult.free().unwrap();
        assert_eq!(DROPS.load(Ordering::Acquire), 1);
    }
    weft::finalize().unwrap();
}
