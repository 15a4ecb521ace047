// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reader-writer lock, composed from a mutex and a condition variable.

use crate::sync::{Condvar, Mutex};
use crate::{global, Result};
use core::cell::UnsafeCell;
use core::fmt;

#[derive(Default)]
struct RwState {
    reader_count: usize,
    write_flag: bool,
}

pub struct RwLock {
    mutex: Mutex,
    cond: Condvar,
    /// Guarded by `mutex`.
    state: UnsafeCell<RwState>,
}

// Safety: `state` is only touched while `mutex` is held.
unsafe impl Send for RwLock {}
// Safety: as above.
unsafe impl Sync for RwLock {}

#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
}

#[must_use = "if unused the RwLock will immediately unlock"]
pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
}

impl RwLock {
    #[must_use]
    pub fn new() -> RwLock {
        RwLock {
            mutex: Mutex::new(),
            cond: Condvar::new(),
            state: UnsafeCell::new(RwState::default()),
        }
    }

    #[expect(clippy::mut_from_ref, reason = "guarded by `mutex`")]
    unsafe fn state(&self) -> &mut RwState {
        // Safety: per the callers, `mutex` is held.
        unsafe { &mut *self.state.get() }
    }

    /// Acquire shared access.
    pub fn read(&self) -> Result<RwLockReadGuard<'_>> {
        global::ensure_init()?;
        let mut guard = self.mutex.lock()?;
        // Safety: holding the mutex.
        while unsafe { self.state() }.write_flag {
            guard = self.cond.wait(guard)?;
        }
        // Safety: holding the mutex.
        unsafe { self.state() }.reader_count += 1;
        drop(guard);
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquire exclusive access.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_>> {
        global::ensure_init()?;
        let mut guard = self.mutex.lock()?;
        loop {
            // Safety: holding the mutex.
            let state = unsafe { self.state() };
            if !state.write_flag && state.reader_count == 0 {
                state.write_flag = true;
                break;
            }
            guard = self.cond.wait(guard)?;
        }
        drop(guard);
        Ok(RwLockWriteGuard { lock: self })
    }

    fn unlock_read(&self) {
        let guard = self.mutex.lock().expect("rwlock poisoned by finalize");
        // Safety: holding the mutex.
        let state = unsafe { self.state() };
        state.reader_count -= 1;
        let wake = state.reader_count == 0;
        if wake {
            let _unused = self.cond.broadcast();
        }
        drop(guard);
    }

    fn unlock_write(&self) {
        let guard = self.mutex.lock().expect("rwlock poisoned by finalize");
        // Safety: holding the mutex.
        unsafe { self.state() }.write_flag = false;
        let _unused = self.cond.broadcast();
        drop(guard);
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock").finish_non_exhaustive()
    }
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
