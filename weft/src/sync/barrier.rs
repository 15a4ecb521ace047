// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Barrier for work units (and external threads).

use crate::spin::RawSpinlock;
use crate::waitlist::WaitList;
use crate::{global, Error, Result};
use core::cell::UnsafeCell;
use core::fmt;

pub struct Barrier {
    lock: RawSpinlock,
    /// Guarded by `lock`.
    num_waiters: UnsafeCell<usize>,
    /// Guarded by `lock`.
    counter: UnsafeCell<usize>,
    waitlist: WaitList,
}

// Safety: the counters are only touched while `lock` is held.
unsafe impl Send for Barrier {}
// Safety: as above.
unsafe impl Sync for Barrier {}

impl Barrier {
    #[must_use]
    pub fn new(num_waiters: usize) -> Barrier {
        Barrier {
            lock: RawSpinlock::new(),
            num_waiters: UnsafeCell::new(num_waiters),
            counter: UnsafeCell::new(0),
            waitlist: WaitList::new(),
        }
    }

    /// Block until `num_waiters` contexts have arrived; the last arrival
    /// releases everyone.
    pub fn wait(&self) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the lock.
        let (counter, num) = unsafe { (&mut *self.counter.get(), *self.num_waiters.get()) };
        *counter += 1;
        if *counter == num {
            *counter = 0;
            // Safety: holding the lock, which guards this wait-list.
            unsafe { self.waitlist.broadcast() };
            self.lock.release();
        } else {
            // Safety: holding the lock.
            unsafe { self.waitlist.wait_and_unlock(&self.lock) };
        }
        Ok(())
    }

    /// Change the arrival count. Only legal while nobody is waiting.
    pub fn reinit(&self, num_waiters: usize) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the lock.
        let busy = !unsafe { self.waitlist.is_empty() };
        if busy {
            self.lock.release();
            return Err(Error::InvalidState);
        }
        // Safety: holding the lock.
        unsafe { *self.num_waiters.get() = num_waiters };
        self.lock.release();
        Ok(())
    }

    #[must_use]
    pub fn num_waiters(&self) -> usize {
        self.lock.acquire();
        // Safety: holding the lock.
        let num = unsafe { *self.num_waiters.get() };
        self.lock.release();
        num
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}
