// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Like `basic`, but instead of napping on an empty sweep this scheduler
//! parks on its first pool's `pop_wait` (when the pool provides one), so a
//! push wakes it immediately.

use crate::pool::{PoolCaps, PoolContext};
use crate::sched::{check_events, sweep_once, Sched, SchedOps};
use crate::ult;
use core::time::Duration;

const WAIT_SLICE: Duration = Duration::from_millis(10);

pub(super) struct BasicWaitSched;

impl SchedOps for BasicWaitSched {
    fn run(&self, sched: &Sched) {
        let event_freq = sched.inner.event_freq;
        let mut pop_count: u32 = 0;

        loop {
            let mut scheduled = sweep_once(sched);
            pop_count += 1;

            if !scheduled {
                let first = &sched.pools()[0];
                if first.caps().contains(PoolCaps::POP_WAIT) {
                    if let Some(unit) =
                        first.inner.pop_wait_unit(WAIT_SLICE, PoolContext::OP_POOL_OTHER)
                    {
                        ult::schedule(unit);
                        scheduled = true;
                    }
                    pop_count = event_freq;
                }
            }

            if pop_count >= event_freq {
                check_events(sched);
                if sched.has_to_stop() {
                    break;
                }
                if !scheduled && !sched.pools()[0].caps().contains(PoolCaps::POP_WAIT) {
                    std::thread::sleep(sched.inner.sleep);
                }
                pop_count = 0;
            }
        }
    }
}
