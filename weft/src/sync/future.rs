// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Future: a fixed number of value compartments filled by contributors;
//! waiters block until every compartment is set. Not related to
//! `core::future::Future`.

use crate::spin::RawSpinlock;
use crate::waitlist::WaitList;
use crate::{global, Error, Result};
use core::cell::UnsafeCell;
use core::fmt;

pub type FutureCallback<T> = dyn Fn(&[T]) + Send + Sync;

pub struct Future<T> {
    lock: RawSpinlock,
    num_compartments: usize,
    /// Guarded by `lock`.
    values: UnsafeCell<Vec<T>>,
    /// Invoked once, under the lock, when the last compartment is filled.
    callback: Option<Box<FutureCallback<T>>>,
    waitlist: WaitList,
}

// Safety: `values` is only touched while `lock` is held.
unsafe impl<T: Send> Send for Future<T> {}
// Safety: as above.
unsafe impl<T: Send> Sync for Future<T> {}

impl<T: Send> Future<T> {
    #[must_use]
    pub fn new(num_compartments: usize) -> Future<T> {
        Self::with_callback_opt(num_compartments, None)
    }

    #[must_use]
    pub fn with_callback(
        num_compartments: usize,
        callback: Box<FutureCallback<T>>,
    ) -> Future<T> {
        Self::with_callback_opt(num_compartments, Some(callback))
    }

    fn with_callback_opt(
        num_compartments: usize,
        callback: Option<Box<FutureCallback<T>>>,
    ) -> Future<T> {
        Future {
            lock: RawSpinlock::new(),
            num_compartments,
            values: UnsafeCell::new(Vec::with_capacity(num_compartments)),
            callback,
            waitlist: WaitList::new(),
        }
    }

    /// Fill the next compartment; the last fill runs the callback and wakes
    /// all waiters.
    pub fn set(&self, value: T) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the lock.
        let values = unsafe { &mut *self.values.get() };
        if values.len() >= self.num_compartments {
            self.lock.release();
            return Err(Error::InvalidState);
        }
        values.push(value);
        if values.len() == self.num_compartments {
            if let Some(callback) = &self.callback {
                callback(values);
            }
            // Safety: holding the lock, which guards this wait-list.
            unsafe { self.waitlist.broadcast() };
        }
        self.lock.release();
        Ok(())
    }

    /// Block until every compartment is filled.
    pub fn wait(&self) -> Result<()> {
        global::ensure_init()?;
        loop {
            self.lock.acquire();
            // Safety: holding the lock.
            let ready = unsafe { &*self.values.get() }.len() == self.num_compartments;
            if ready {
                self.lock.release();
                return Ok(());
            }
            // Safety: holding the lock.
            unsafe { self.waitlist.wait_and_unlock(&self.lock) };
        }
    }

    /// Whether every compartment is filled, without blocking.
    #[must_use]
    pub fn test(&self) -> bool {
        self.lock.acquire();
        // Safety: holding the lock.
        let ready = unsafe { &*self.values.get() }.len() == self.num_compartments;
        self.lock.release();
        ready
    }

    /// Run `f` on the compartments filled so far.
    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        self.lock.acquire();
        // Safety: holding the lock.
        let result = f(unsafe { &*self.values.get() });
        self.lock.release();
        result
    }

    /// Empty all compartments so the future can be reused.
    pub fn reset(&self) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the lock.
        unsafe { &mut *self.values.get() }.clear();
        self.lock.release();
        Ok(())
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("num_compartments", &self.num_compartments)
            .finish_non_exhaustive()
    }
}
