// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The basic scheduler: sweep the pools in access order, dispatch the first
//! unit found, check events every `event_freq` pops, and nap briefly when a
//! full sweep came up empty.

use crate::sched::{check_events, sweep_once, Sched, SchedOps};

pub(super) struct BasicSched;

impl SchedOps for BasicSched {
    fn run(&self, sched: &Sched) {
        let event_freq = sched.inner.event_freq;
        let mut pop_count: u32 = 0;

        loop {
            let scheduled = sweep_once(sched);
            pop_count += 1;

            if pop_count >= event_freq {
                check_events(sched);
                if sched.has_to_stop() {
                    break;
                }
                if !scheduled {
                    std::thread::sleep(sched.inner.sleep);
                }
                pop_count = 0;
            }
        }
    }
}
