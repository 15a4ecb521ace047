// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Eventual: a write-once (but resettable) value waiters can block on.

use crate::spin::RawSpinlock;
use crate::waitlist::WaitList;
use crate::{global, Result};
use core::cell::UnsafeCell;
use core::fmt;

pub struct Eventual<T> {
    lock: RawSpinlock,
    /// Guarded by `lock`.
    value: UnsafeCell<Option<T>>,
    waitlist: WaitList,
}

// Safety: `value` is only touched while `lock` is held.
unsafe impl<T: Send> Send for Eventual<T> {}
// Safety: as above.
unsafe impl<T: Send> Sync for Eventual<T> {}

impl<T: Send> Eventual<T> {
    #[must_use]
    pub fn new() -> Eventual<T> {
        Eventual {
            lock: RawSpinlock::new(),
            value: UnsafeCell::new(None),
            waitlist: WaitList::new(),
        }
    }

    /// Publish the value and wake every waiter.
    pub fn set(&self, value: T) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the lock.
        unsafe { *self.value.get() = Some(value) };
        // Safety: holding the lock, which guards this wait-list.
        unsafe { self.waitlist.broadcast() };
        self.lock.release();
        Ok(())
    }

    /// Block until the value is set.
    pub fn wait(&self) -> Result<()> {
        global::ensure_init()?;
        loop {
            self.lock.acquire();
            // Safety: holding the lock.
            if unsafe { &*self.value.get() }.is_some() {
                self.lock.release();
                return Ok(());
            }
            // Safety: holding the lock.
            unsafe { self.waitlist.wait_and_unlock(&self.lock) };
        }
    }

    /// Whether the value is set, without blocking.
    #[must_use]
    pub fn test(&self) -> bool {
        self.lock.acquire();
        // Safety: holding the lock.
        let ready = unsafe { &*self.value.get() }.is_some();
        self.lock.release();
        ready
    }

    /// Run `f` on the current value.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        self.lock.acquire();
        // Safety: holding the lock.
        let result = f(unsafe { &*self.value.get() }.as_ref());
        self.lock.release();
        result
    }

    /// Clear the value so the eventual can be set again.
    pub fn reset(&self) -> Option<T> {
        self.lock.acquire();
        // Safety: holding the lock.
        let value = unsafe { &mut *self.value.get() }.take();
        self.lock.release();
        value
    }
}

impl<T: Send> Default for Eventual<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Eventual<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eventual").finish_non_exhaustive()
    }
}
