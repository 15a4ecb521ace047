// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pool behavior: built-ins, waiting pops, and user-defined pools.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use weft::{
    current, Pool, PoolAccess, PoolCaps, PoolContext, Sched, SchedConfig, Ult, UserPoolDef,
    Xstream,
};

fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: StdMutex<()> = StdMutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = serial();
    weft::init().unwrap();
    guard
}

#[test]
fn fifo_pool_orders_and_counts() {
    let _guard = setup();
    {
        let pool = Pool::fifo(PoolAccess::Mpmc, true).unwrap();
        assert!(pool.is_empty());
        assert!(pool.caps().contains(PoolCaps::REMOVE));

        let a = Ult::create(&pool, || {}).unwrap();
        let _b = Ult::create(&pool, || {}).unwrap();
        assert_eq!(pool.len(), Some(2));
        assert_eq!(pool.total_size(), 2);

        let mut seen = Vec::new();
        pool.print_all(|unit| seen.push(unit.id())).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], a.id());

        // Pop hands the units out in push order; run them to completion.
        let first = pool.pop().unwrap().unwrap();
        assert_eq!(first.id(), a.id());
        current::run_unit(first).unwrap();
        let second = pool.pop().unwrap().unwrap();
        current::run_unit(second).unwrap();
        assert!(pool.is_empty());
        assert!(pool.pop().unwrap().is_none());
    }
    weft::finalize().unwrap();
}

#[test]
fn fifo_wait_pop_blocks_until_a_push() {
    let _guard = setup();
    {
        let pool = Pool::fifo_wait(PoolAccess::Mpmc, true).unwrap();

        // Empty pool: the wait expires.
        let start = Instant::now();
        assert!(pool.pop_wait(Duration::from_millis(20)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));

        // A push from another OS thread wakes the parked popper.
        let pusher = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                Ult::create(&pool, || {}).unwrap()
            })
        };
        let popped = pool
            .pop_wait(Duration::from_secs(5))
            .unwrap()
            .expect("push must wake the waiting pop");
        current::run_unit(popped).unwrap();
        pusher.join().unwrap().join().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn randws_pool_drains_across_streams() {
    let _guard = setup();
    {
        let pool = Pool::randws(PoolAccess::Mpmc, true).unwrap();
        let sched = Sched::basic(&[pool.clone()], &SchedConfig::default()).unwrap();
        let xs = Xstream::create_with_sched(Some(&sched)).unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let ults: Vec<Ult> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Ult::create(&pool, move || {
                    counter.fetch_add(1, Ordering::Release);
                })
                .unwrap()
            })
            .collect();
        for u in ults {
            u.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Acquire), 8);
        assert!(pool.is_empty());
        xs.free().unwrap();
    }
    weft::finalize().unwrap();
}

/// A user pool over a plain deque of tokens.
struct DequePool {
    state: StdMutex<DequeState>,
}

struct DequeState {
    next_token: u64,
    queue: VecDeque<u64>,
}

impl DequePool {
    fn new() -> Self {
        Self {
            state: StdMutex::new(DequeState {
                next_token: 1,
                queue: VecDeque::new(),
            }),
        }
    }
}

impl UserPoolDef for DequePool {
    fn create_unit(&self, _unit: &weft::AnyUnit) -> u64 {
        let mut state = self.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;
        token
    }

    fn free_unit(&self, _token: u64) {}

    fn push(&self, token: u64, _ctx: PoolContext) {
        self.state.lock().unwrap().queue.push_back(token);
    }

    fn pop(&self, _ctx: PoolContext) -> Option<u64> {
        self.state.lock().unwrap().queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }

    fn get_size(&self) -> Option<usize> {
        Some(self.state.lock().unwrap().queue.len())
    }

    fn caps(&self) -> PoolCaps {
        PoolCaps::SIZE
    }
}

#[test]
fn user_defined_pool_feeds_a_scheduler() {
    let _guard = setup();
    {
        let pool = Pool::custom(Box::new(DequePool::new()), PoolAccess::Mpmc, true).unwrap();
        let sched = Sched::basic(&[pool.clone()], &SchedConfig::default()).unwrap();
        let xs = Xstream::create_with_sched(Some(&sched)).unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let ults: Vec<Ult> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Ult::create(&pool, move || {
                    counter.fetch_add(1, Ordering::Release);
                    current::yield_now().unwrap();
                    counter.fetch_add(1, Ordering::Release);
                })
                .unwrap()
            })
            .collect();
        for u in ults {
            u.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Acquire), 8);
        assert!(pool.is_empty());
        xs.free().unwrap();
    }
    weft::finalize().unwrap();
}

#[test]
fn pop_timedwait_maps_the_deadline() {
    let _guard = setup();
    {
        let pool = Pool::fifo_wait(PoolAccess::Mpmc, true).unwrap();
        let deadline = Instant::now() + Duration::from_millis(15);
        assert!(pool.pop_timedwait(deadline).unwrap().is_none());
        assert!(Instant::now() >= deadline - Duration::from_millis(1));
    }
    weft::finalize().unwrap();
}
