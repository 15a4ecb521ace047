// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scheduling scenarios.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use weft::{current, Pool, PoolAccess, Sched, SchedConfig, Tasklet, Ult, UnitState, Xstream};

/// The runtime is process-global; tests serialize on this and each one runs
/// a full init/finalize cycle on its own thread.
fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = serial();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    weft::init().unwrap();
    guard
}

fn main_pool() -> Pool {
    current::xstream().unwrap().main_pool().unwrap()
}

#[test]
fn ping_pong_yield_to() {
    let _guard = setup();
    {
        let pool = main_pool();
        let trace: Arc<Mutex<Vec<char>>> = Arc::new(Mutex::new(Vec::new()));
        let slot_b: Arc<OnceLock<Ult>> = Arc::new(OnceLock::new());

        let a = {
            let trace = Arc::clone(&trace);
            let slot_b = Arc::clone(&slot_b);
            Ult::create(&pool, move || {
                let b = slot_b.get().expect("B exists before A runs").clone();
                b.yield_to().unwrap();
                trace.lock().unwrap().push('a');
            })
            .unwrap()
        };
        let b = {
            let trace = Arc::clone(&trace);
            let a = a.clone();
            Ult::create(&pool, move || {
                a.yield_to().unwrap();
                trace.lock().unwrap().push('b');
            })
            .unwrap()
        };
        slot_b.set(b.clone()).ok();

        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!['a', 'b']);
        assert_eq!(a.state(), UnitState::Terminated);
        assert_eq!(b.state(), UnitState::Terminated);
    }
    weft::finalize().unwrap();
}

#[test]
fn mutex_wakes_waiters_in_fifo_order() {
    let _guard = setup();
    {
        let pool = main_pool();
        let mutex = Arc::new(weft::sync::Mutex::new());
        let buf: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

        // W0 grabs the lock first and keeps yielding so W1..W4 each get a
        // turn to block on it, in creation order.
        let w0 = {
            let mutex = Arc::clone(&mutex);
            Ult::create(&pool, move || {
                let guard = mutex.lock().unwrap();
                for _ in 0..10 {
                    current::yield_now().unwrap();
                }
                drop(guard);
            })
            .unwrap()
        };
        let workers: Vec<Ult> = (1..=4)
            .map(|i| {
                let mutex = Arc::clone(&mutex);
                let buf = Arc::clone(&buf);
                Ult::create(&pool, move || {
                    let _guard = mutex.lock().unwrap();
                    buf.lock().unwrap().push(i);
                })
                .unwrap()
            })
            .collect();

        w0.join().unwrap();
        for w in &workers {
            w.join().unwrap();
        }
        assert_eq!(*buf.lock().unwrap(), vec![1, 2, 3, 4]);
    }
    weft::finalize().unwrap();
}

#[test]
fn cancel_before_run_never_invokes_body() {
    let _guard = setup();
    {
        let side_pool = Pool::fifo(PoolAccess::Mpmc, true).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let cancelled = {
            let ran = Arc::clone(&ran);
            Ult::create(&side_pool, move || ran.store(true, Ordering::Release)).unwrap()
        };
        cancelled.cancel().unwrap();

        // Drain the side pool with a stacked scheduler hosted on the main
        // pool.
        let sched = Sched::basic(
            &[side_pool.clone()],
            &SchedConfig {
                event_freq: Some(1),
                ..SchedConfig::default()
            },
        )
        .unwrap();
        let host = sched.spawn_on(&main_pool()).unwrap();

        cancelled.join().unwrap();
        assert!(!ran.load(Ordering::Acquire), "cancelled body must not run");
        assert_eq!(cancelled.state(), UnitState::Terminated);

        sched.finish();
        host.join().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn external_thread_join_parks_until_termination() {
    let _guard = setup();
    {
        let xs = Xstream::create().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let ult = {
            let done = Arc::clone(&done);
            Ult::create_on_xstream(&xs, move || {
                std::thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::Release);
            })
            .unwrap()
        };

        let joiner = {
            let ult = ult.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                ult.join().unwrap();
                // The join may only return once the body finished.
                assert!(done.load(Ordering::Acquire));
            })
        };
        joiner.join().unwrap();
        assert_eq!(ult.state(), UnitState::Terminated);
        xs.free().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn migration_moves_a_ult_between_streams() {
    let _guard = setup();
    {
        let xs2 = Xstream::create().unwrap();
        let ranks: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let callbacks = Arc::new(AtomicU32::new(0));

        let ult = {
            let ranks = Arc::clone(&ranks);
            Ult::create(&main_pool(), move || {
                for _ in 0..4 {
                    ranks.lock().unwrap().push(current::xstream_rank().unwrap());
                    current::yield_now().unwrap();
                }
            })
            .unwrap()
        };
        {
            let callbacks = Arc::clone(&callbacks);
            ult.set_callback(move |_u| {
                callbacks.fetch_add(1, Ordering::Release);
            })
            .unwrap();
        }

        // Let the ULT record its first rank on this stream.
        current::yield_now().unwrap();
        ult.migrate_to_xstream(&xs2).unwrap();
        ult.join().unwrap();

        let recorded = ranks.lock().unwrap().clone();
        assert_eq!(recorded.len(), 4);
        assert_eq!(recorded[0], 0, "first iteration runs on the primary");
        assert!(
            recorded[1..].iter().all(|&rank| rank == xs2.rank()),
            "iterations after the migration run on the target stream, got {recorded:?}"
        );
        assert_eq!(callbacks.load(Ordering::Acquire), 1);
        xs2.free().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn main_sched_replacement_preserves_progress() {
    let _guard = setup();
    {
        let xs = current::xstream().unwrap();
        let p1 = xs.main_pool().unwrap();
        let p2 = Pool::fifo(PoolAccess::Mpmc, true).unwrap();
        let s2 = Sched::basic(&[p1, p2.clone()], &SchedConfig::default()).unwrap();

        xs.set_main_sched(&s2).unwrap();
        assert_eq!(xs.main_sched().unwrap(), s2);
        assert_eq!(s2.used(), weft::SchedUsed::Main);

        // Units pushed into the new scheduler's extra pool are now drained.
        let ran = Arc::new(AtomicBool::new(false));
        let ult = {
            let ran = Arc::clone(&ran);
            Ult::create(&p2, move || ran.store(true, Ordering::Release)).unwrap()
        };
        ult.join().unwrap();
        assert!(ran.load(Ordering::Acquire));

        // The primary itself kept making progress the whole time.
        current::yield_now().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn create_to_transfers_immediately() {
    let _guard = setup();
    {
        let ran = Arc::new(AtomicBool::new(false));
        let ult = {
            let ran = Arc::clone(&ran);
            Ult::create_to(&main_pool(), move || ran.store(true, Ordering::Release)).unwrap()
        };
        // `create_to` only returns to us after a round trip through the
        // target; it may still be running, but a join settles it.
        ult.join().unwrap();
        assert!(ran.load(Ordering::Acquire));
    }
    weft::finalize().unwrap();
}

#[test]
fn revive_reruns_a_terminated_ult() {
    let _guard = setup();
    {
        let pool = main_pool();
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));

        let ult = {
            let first = Arc::clone(&first);
            Ult::create(&pool, move || first.store(true, Ordering::Release)).unwrap()
        };
        ult.join().unwrap();
        assert_eq!(ult.state(), UnitState::Terminated);
        assert!(first.load(Ordering::Acquire));

        // Revive on a non-terminated unit is rejected.
        let live = Ult::create(&pool, || {
            current::yield_now().unwrap();
        })
        .unwrap();
        assert_eq!(
            live.revive(&pool, || {}).unwrap_err(),
            weft::Error::InvalidState
        );

        {
            let second = Arc::clone(&second);
            ult.revive(&pool, move || second.store(true, Ordering::Release))
                .unwrap();
        }
        ult.join().unwrap();
        assert!(second.load(Ordering::Acquire));
        live.join().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn xstream_join_revive_free_lifecycle() {
    let _guard = setup();
    {
        let xs = Xstream::create().unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        let u1 = {
            let counter = Arc::clone(&counter);
            Ult::create_on_xstream(&xs, move || {
                counter.fetch_add(1, Ordering::Release);
            })
            .unwrap()
        };
        u1.join().unwrap();

        xs.join().unwrap();
        assert_eq!(xs.state(), weft::XstreamState::Terminated);

        xs.revive().unwrap();
        assert_eq!(xs.state(), weft::XstreamState::Running);
        let u2 = {
            let counter = Arc::clone(&counter);
            Ult::create_on_xstream(&xs, move || {
                counter.fetch_add(1, Ordering::Release);
            })
            .unwrap()
        };
        u2.join().unwrap();
        assert_eq!(counter.load(Ordering::Acquire), 2);

        xs.free().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn tasklet_runs_inline_on_the_dispatcher() {
    let _guard = setup();
    {
        let ran = Arc::new(AtomicBool::new(false));
        let tasklet = {
            let ran = Arc::clone(&ran);
            Tasklet::create(&main_pool(), move || ran.store(true, Ordering::Release)).unwrap()
        };
        tasklet.join().unwrap();
        assert!(ran.load(Ordering::Acquire));
        assert_eq!(tasklet.state(), UnitState::Terminated);
    }
    weft::finalize().unwrap();
}

#[test]
fn suspend_resume_roundtrip() {
    let _guard = setup();
    {
        let stage = Arc::new(AtomicU32::new(0));
        let ult = {
            let stage = Arc::clone(&stage);
            Ult::create(&main_pool(), move || {
                stage.store(1, Ordering::Release);
                current::suspend().unwrap();
                stage.store(2, Ordering::Release);
            })
            .unwrap()
        };

        while stage.load(Ordering::Acquire) != 1 {
            current::yield_now().unwrap();
        }
        assert_eq!(ult.state(), UnitState::Blocked);
        // Resuming a unit that is not blocked is rejected; this one is.
        ult.resume().unwrap();
        ult.join().unwrap();
        assert_eq!(stage.load(Ordering::Acquire), 2);
    }
    weft::finalize().unwrap();
}
