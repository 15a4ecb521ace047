// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Random work-stealing pool.
//!
//! Each consumer rank gets a local queue; pushes from a stream land on its
//! own queue, pushes from outside the runtime on a shared overflow queue.
//! A pop drains local work first, then the shared queue, then steals from the
//! tail of a randomly chosen victim.

use crate::pool::fifo::FifoCore;
use crate::pool::{PoolCaps, PoolContext, PoolImpl};
use crate::unit::UnitRef;
use crate::local;

pub(super) struct RandWsPool {
    locals: Box<[FifoCore]>,
    shared: FifoCore,
}

impl RandWsPool {
    pub(super) fn new(fan: usize) -> Self {
        let fan = fan.max(1);
        Self {
            locals: (0..fan).map(|_| FifoCore::new()).collect(),
            shared: FifoCore::new(),
        }
    }

    fn local_index(&self) -> Option<usize> {
        let rank = local::current()?.rank();
        usize::try_from(rank).ok().map(|r| r % self.locals.len())
    }
}

impl PoolImpl for RandWsPool {
    fn push(&self, unit: UnitRef, _ctx: PoolContext) {
        match self.local_index() {
            Some(idx) => self.locals[idx].push_back(unit),
            None => self.shared.push_back(unit),
        }
    }

    fn pop(&self, _ctx: PoolContext) -> Option<UnitRef> {
        let home = self.local_index();
        if let Some(idx) = home {
            if let Some(unit) = self.locals[idx].pop_front() {
                return Some(unit);
            }
        }
        if let Some(unit) = self.shared.pop_front() {
            return Some(unit);
        }
        // Steal from one random victim per attempt.
        let victims = self.locals.len();
        if victims > 1 || home.is_none() {
            let victim = fastrand::usize(..victims);
            if Some(victim) != home {
                if let Some(unit) = self.locals[victim].pop_back() {
                    return Some(unit);
                }
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.locals.iter().all(FifoCore::is_empty)
    }

    fn caps(&self) -> PoolCaps {
        PoolCaps::SIZE | PoolCaps::PRINT
    }

    fn size(&self) -> Option<usize> {
        let local: usize = self.locals.iter().map(FifoCore::len).sum();
        Some(local + self.shared.len())
    }

    fn for_each(&self, f: &mut dyn FnMut(&UnitRef)) -> crate::Result<()> {
        for queue in &self.locals {
            queue.for_each(f);
        }
        self.shared.for_each(f);
        Ok(())
    }
}
