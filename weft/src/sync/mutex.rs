// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperative mutex.
//!
//! The lock word is a test-and-set spinlock; a contender that loses the fast
//! path enqueues itself on the wait-list and blocks. Unlock releases the
//! word and signals the first waiter, which re-attempts the acquisition (a
//! simultaneous fresh locker may barge in; waiters then re-queue, so every
//! waiter makes progress as long as the lock keeps being released).

use crate::spin::RawSpinlock;
use crate::sync::self_id;
use crate::waitlist::WaitList;
use crate::{global, Error, Result};
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A mutual-exclusion lock usable from ULTs, tasklets and external threads.
pub struct Mutex {
    recursive: bool,
    /// The lock word itself.
    lock: RawSpinlock,
    /// Owner identity, maintained for recursive mutexes only.
    owner: AtomicU64,
    /// Recursion depth beyond the first acquisition.
    nesting: AtomicU32,
    waiter_lock: RawSpinlock,
    waitlist: WaitList,
}

/// RAII guard; unlocks on drop.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Mutex {
    #[must_use]
    pub fn new() -> Mutex {
        Self::with_recursion(false)
    }

    /// A mutex the owning context may lock repeatedly.
    #[must_use]
    pub fn new_recursive() -> Mutex {
        Self::with_recursion(true)
    }

    fn with_recursion(recursive: bool) -> Mutex {
        Mutex {
            recursive,
            lock: RawSpinlock::new(),
            owner: AtomicU64::new(0),
            nesting: AtomicU32::new(0),
            waiter_lock: RawSpinlock::new(),
            waitlist: WaitList::new(),
        }
    }

    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Acquire the mutex, blocking the calling context until it is free.
    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        global::ensure_init()?;
        if self.recursive && self.owner.load(Ordering::Acquire) == self_id() {
            self.nesting.fetch_add(1, Ordering::Relaxed);
            return Ok(MutexGuard { mutex: self });
        }

        loop {
            if self.lock.try_acquire() {
                break;
            }
            self.waiter_lock.acquire();
            // Re-check under the waiter lock so an unlock that ran between
            // the failed attempt and the enqueue cannot strand us.
            if self.lock.try_acquire() {
                self.waiter_lock.release();
                break;
            }
            // Safety: holding the waiter lock, which guards this wait-list.
            unsafe { self.waitlist.wait_and_unlock(&self.waiter_lock) };
        }

        if self.recursive {
            self.owner.store(self_id(), Ordering::Release);
        }
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire the mutex if it is free right now.
    pub fn try_lock(&self) -> Result<MutexGuard<'_>> {
        global::ensure_init()?;
        if self.recursive && self.owner.load(Ordering::Acquire) == self_id() {
            self.nesting.fetch_add(1, Ordering::Relaxed);
            return Ok(MutexGuard { mutex: self });
        }
        if self.lock.try_acquire() {
            if self.recursive {
                self.owner.store(self_id(), Ordering::Release);
            }
            Ok(MutexGuard { mutex: self })
        } else {
            Err(Error::LockBusy)
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    fn unlock(&self) {
        if self.recursive {
            if self.nesting.load(Ordering::Relaxed) > 0 {
                self.nesting.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            self.owner.store(0, Ordering::Release);
        }
        self.lock.release();
        self.waiter_lock.acquire();
        // Safety: holding the waiter lock.
        unsafe { self.waitlist.signal() };
        self.waiter_lock.release();
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("recursive", &self.recursive)
            .finish()
    }
}

impl<'a> MutexGuard<'a> {
    pub(crate) fn mutex(&self) -> &'a Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard").finish_non_exhaustive()
    }
}
