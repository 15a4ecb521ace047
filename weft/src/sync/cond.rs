// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Condition variable.
//!
//! The waiter enqueues on the condvar's wait-list while holding the condvar
//! lock, *then* releases the user mutex; a signaller must take the condvar
//! lock to reach the list, so no wakeup can fall between the mutex release
//! and the sleep.

use crate::spin::RawSpinlock;
use crate::sync::{Mutex, MutexGuard};
use crate::waitlist::WaitList;
use crate::{global, Error, Result};
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::time::Instant;

pub struct Condvar {
    lock: RawSpinlock,
    /// The mutex this condvar is used with; all waiters must agree.
    waiter_mutex: AtomicPtr<()>,
    waitlist: WaitList,
}

impl Condvar {
    #[must_use]
    pub fn new() -> Condvar {
        Condvar {
            lock: RawSpinlock::new(),
            waiter_mutex: AtomicPtr::new(ptr::null_mut()),
            waitlist: WaitList::new(),
        }
    }

    fn check_mutex(&self, mutex: &Mutex) -> Result<()> {
        let mutex_ptr = ptr::from_ref(mutex).cast::<()>().cast_mut();
        let seen = self.waiter_mutex.load(Ordering::Acquire);
        if seen.is_null() {
            self.waiter_mutex.store(mutex_ptr, Ordering::Release);
            return Ok(());
        }
        if seen == mutex_ptr {
            Ok(())
        } else {
            Err(Error::InvalidArg)
        }
    }

    /// Atomically release the guarded mutex and wait for a signal, then
    /// re-acquire the mutex.
    pub fn wait<'m>(&self, guard: MutexGuard<'m>) -> Result<MutexGuard<'m>> {
        global::ensure_init()?;
        let mutex = guard.mutex();
        self.lock.acquire();
        if let Err(err) = self.check_mutex(mutex) {
            self.lock.release();
            return Err(err);
        }
        // Holding the condvar lock across the mutex release closes the
        // signal window.
        drop(guard);
        // Safety: holding the condvar lock, which guards this wait-list.
        unsafe { self.waitlist.wait_and_unlock(&self.lock) };
        mutex.lock()
    }

    /// As [`wait`](Self::wait), bounded by an absolute deadline. The boolean
    /// is true if the wait timed out.
    pub fn wait_timeout<'m>(
        &self,
        guard: MutexGuard<'m>,
        deadline: Instant,
    ) -> Result<(MutexGuard<'m>, bool)> {
        global::ensure_init()?;
        let mutex = guard.mutex();
        self.lock.acquire();
        if let Err(err) = self.check_mutex(mutex) {
            self.lock.release();
            return Err(err);
        }
        drop(guard);
        // Safety: holding the condvar lock.
        let timed_out = unsafe { self.waitlist.wait_timed_and_unlock(&self.lock, deadline) };
        Ok((mutex.lock()?, timed_out))
    }

    /// Wake one waiter.
    pub fn signal(&self) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the condvar lock.
        unsafe { self.waitlist.signal() };
        self.lock.release();
        Ok(())
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> Result<()> {
        global::ensure_init()?;
        self.lock.acquire();
        // Safety: holding the condvar lock.
        unsafe { self.waitlist.broadcast() };
        self.lock.release();
        Ok(())
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
