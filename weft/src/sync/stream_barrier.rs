// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Barrier across execution streams.
//!
//! Unlike [`Barrier`](crate::sync::Barrier) this parks the backing OS
//! threads themselves (it is meant to line up whole streams, one waiter per
//! stream), so waiting from a ULT stalls its entire stream.

use crate::park::ParkGroup;
use crate::spin::RawSpinlock;
use crate::{global, Result};
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub struct XstreamBarrier {
    lock: RawSpinlock,
    num_waiters: usize,
    /// Guarded by `lock`.
    counter: UnsafeCell<usize>,
    /// Bumped at every release; sleepers use it to tell their own release
    /// apart from the next round's.
    tag: AtomicU64,
    park: ParkGroup,
}

// Safety: `counter` is only touched while `lock` is held.
unsafe impl Send for XstreamBarrier {}
// Safety: as above.
unsafe impl Sync for XstreamBarrier {}

impl XstreamBarrier {
    #[must_use]
    pub fn new(num_waiters: usize) -> XstreamBarrier {
        XstreamBarrier {
            lock: RawSpinlock::new(),
            num_waiters,
            counter: UnsafeCell::new(0),
            tag: AtomicU64::new(0),
            park: ParkGroup::new(),
        }
    }

    /// Park the calling OS thread until `num_waiters` threads have arrived.
    pub fn wait(&self) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the lock.
        let counter = unsafe { &mut *self.counter.get() };
        *counter += 1;
        if *counter == self.num_waiters {
            *counter = 0;
            self.tag.fetch_add(1, Ordering::Release);
            self.park.broadcast();
            self.lock.release();
            return Ok(());
        }
        let tag = self.tag.load(Ordering::Acquire);
        loop {
            self.park.wait_and_unlock(&self.lock);
            if self.tag.load(Ordering::Acquire) != tag {
                return Ok(());
            }
            self.lock.acquire();
            // Re-check with the lock held: the release may have happened
            // while we were re-acquiring.
            if self.tag.load(Ordering::Acquire) != tag {
                self.lock.release();
                return Ok(());
            }
        }
    }

    #[must_use]
    pub fn num_waiters(&self) -> usize {
        self.num_waiters
    }
}

impl fmt::Debug for XstreamBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XstreamBarrier")
            .field("num_waiters", &self.num_waiters)
            .finish_non_exhaustive()
    }
}
