// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! FIFO pool with a parking `pop_wait`: consumers sleep on the pool's park
//! group instead of spinning, and every push wakes them for a re-check.

use crate::park::ParkGroup;
use crate::pool::fifo::FifoCore;
use crate::pool::{PoolCaps, PoolContext, PoolImpl};
use crate::unit::UnitRef;
use crate::Result;
use core::time::Duration;
use std::time::Instant;

pub(super) struct FifoWaitPool {
    core: FifoCore,
    waiter: ParkGroup,
}

impl FifoWaitPool {
    pub(super) fn new() -> Self {
        Self {
            core: FifoCore::new(),
            waiter: ParkGroup::new(),
        }
    }
}

impl PoolImpl for FifoWaitPool {
    fn push(&self, unit: UnitRef, _ctx: PoolContext) {
        self.core.push_back(unit);
        self.waiter.broadcast();
    }

    fn pop(&self, _ctx: PoolContext) -> Option<UnitRef> {
        self.core.pop_front()
    }

    fn pop_wait(&self, timeout: Duration, _ctx: PoolContext) -> Option<UnitRef> {
        let deadline = Instant::now() + timeout;
        loop {
            self.core.lock.acquire();
            // Safety: holding the core lock.
            if let Some(unit) = unsafe { self.core.pop_front_locked() } {
                self.core.lock.release();
                return Some(unit);
            }
            let now = Instant::now();
            if now >= deadline {
                self.core.lock.release();
                return None;
            }
            // Sleeps with the value sampled under the lock, so a push that
            // lands between the release and the sleep still wakes us.
            self.waiter
                .wait_timed_and_unlock(&self.core.lock, deadline - now);
        }
    }

    fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    fn caps(&self) -> PoolCaps {
        PoolCaps::POP_WAIT | PoolCaps::REMOVE | PoolCaps::SIZE | PoolCaps::PRINT
    }

    fn remove(&self, unit: &UnitRef) -> Result<()> {
        self.core.remove(unit)
    }

    fn size(&self) -> Option<usize> {
        Some(self.core.len())
    }

    fn for_each(&self, f: &mut dyn FnMut(&UnitRef)) -> Result<()> {
        self.core.for_each(f);
        Ok(())
    }
}
