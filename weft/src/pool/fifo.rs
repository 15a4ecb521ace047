// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The built-in FIFO pool and the locked intrusive queue shared by the other
//! built-ins.

use crate::pool::{PoolCaps, PoolContext, PoolImpl};
use crate::spin::RawSpinlock;
use crate::unit::{Unit, UnitRef};
use crate::{Error, Result};
use cordyceps::List;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A spinlocked intrusive FIFO of unit descriptors. Descriptor links are the
/// units' own `links` field; list membership holds a counted reference.
pub(super) struct FifoCore {
    pub(super) lock: RawSpinlock,
    list: UnsafeCell<List<Unit>>,
    len: AtomicUsize,
}

// Safety: `list` is only touched while `lock` is held.
unsafe impl Send for FifoCore {}
// Safety: as above.
unsafe impl Sync for FifoCore {}

impl FifoCore {
    pub(super) fn new() -> Self {
        Self {
            lock: RawSpinlock::new(),
            list: UnsafeCell::new(List::new()),
            len: AtomicUsize::new(0),
        }
    }

    #[expect(clippy::mut_from_ref, reason = "guarded by `lock`")]
    unsafe fn list(&self) -> &mut List<Unit> {
        // Safety: per the callers below, `lock` is held.
        unsafe { &mut *self.list.get() }
    }

    pub(super) fn push_back(&self, unit: UnitRef) {
        self.lock.acquire();
        // Safety: holding the lock.
        unsafe { self.list().push_back(unit) };
        self.len.fetch_add(1, Ordering::Relaxed);
        self.lock.release();
    }

    pub(super) fn pop_front(&self) -> Option<UnitRef> {
        self.lock.acquire();
        // Safety: holding the lock.
        let unit = unsafe { self.list().pop_front() };
        if unit.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.release();
        unit
    }

    /// Pop from the back; used by stealers so they contend with the owner as
    /// little as possible.
    pub(super) fn pop_back(&self) -> Option<UnitRef> {
        self.lock.acquire();
        // Safety: holding the lock.
        let unit = unsafe { self.list().pop_back() };
        if unit.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.release();
        unit
    }

    /// Pop while the caller already holds `lock`.
    ///
    /// # Safety
    ///
    /// The caller must hold `lock`.
    pub(super) unsafe fn pop_front_locked(&self) -> Option<UnitRef> {
        // Safety: ensured by caller.
        let unit = unsafe { self.list().pop_front() };
        if unit.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        unit
    }

    pub(super) fn remove(&self, unit: &UnitRef) -> Result<()> {
        self.lock.acquire();
        // Safety: holding the lock; the caller observed the unit in a pool,
        // and the `is_in_pool` re-check below keeps a racing pop honest.
        let removed = unsafe { self.list().remove(unit.as_ptr()) };
        match removed {
            Some(handle) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                self.lock.release();
                drop(handle);
                Ok(())
            }
            None => {
                self.lock.release();
                Err(Error::InvalidState)
            }
        }
    }

    pub(super) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(super) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(super) fn for_each(&self, f: &mut dyn FnMut(&UnitRef)) {
        self.lock.acquire();
        // Safety: holding the lock.
        let list = unsafe { self.list() };
        for unit in list.iter() {
            // Safety: the unit is linked, so a counted reference exists.
            let handle = unsafe { UnitRef::clone_raw(core::ptr::NonNull::from(unit)) };
            f(&handle);
        }
        self.lock.release();
    }
}

pub(super) struct FifoPool {
    core: FifoCore,
}

impl FifoPool {
    pub(super) fn new() -> Self {
        Self {
            core: FifoCore::new(),
        }
    }
}

impl PoolImpl for FifoPool {
    fn push(&self, unit: UnitRef, _ctx: PoolContext) {
        self.core.push_back(unit);
    }

    fn pop(&self, _ctx: PoolContext) -> Option<UnitRef> {
        self.core.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    fn caps(&self) -> PoolCaps {
        PoolCaps::REMOVE | PoolCaps::SIZE | PoolCaps::PRINT
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
