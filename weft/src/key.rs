// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Work-unit-local storage.
//!
//! A [`Key<T>`] names one slot of per-unit storage. The backing keytable is
//! created lazily on a unit's first `set` and sized from the runtime config;
//! insertion of a new entry takes the table spinlock, while lookups walk the
//! slot chains lock-free with acquire loads. Stored values are dropped when
//! the owning unit is freed (not when it is joined); the drop order across
//! keys is unspecified.
//!
//! Access is scoped to the calling unit: storage belongs to whoever is
//! running, exactly like thread-local storage belongs to a thread.

use crate::spin::RawSpinlock;
use crate::unit::Unit;
use crate::{global, local, Error, Result};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

static KEY_ID: AtomicU32 = AtomicU32::new(1);

struct KtElem {
    key_id: u32,
    dtor: Option<unsafe fn(*mut ())>,
    value: AtomicPtr<()>,
    next: AtomicPtr<KtElem>,
}

/// One unit's key-to-value table.
pub(crate) struct Ktable {
    lock: RawSpinlock,
    slots: Box<[AtomicPtr<KtElem>]>,
}

impl Ktable {
    fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            lock: RawSpinlock::new(),
            slots: (0..size).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    fn find(&self, key_id: u32) -> Option<&KtElem> {
        let slot = &self.slots[key_id as usize % self.slots.len()];
        let mut cur = slot.load(Ordering::Acquire);
        while let Some(elem) = NonNull::new(cur) {
            // Safety: published elements live until the table is dropped.
            let elem = unsafe { elem.as_ref() };
            if elem.key_id == key_id {
                return Some(elem);
            }
            cur = elem.next.load(Ordering::Acquire);
        }
        None
    }

    /// Install or replace the value for `key_id`, returning any replaced
    /// value pointer.
    fn set(&self, key_id: u32, dtor: Option<unsafe fn(*mut ())>, value: *mut ()) -> *mut () {
        if let Some(elem) = self.find(key_id) {
            return elem.value.swap(value, Ordering::AcqRel);
        }
        self.lock.acquire();
        // Re-check: another setter may have installed the entry while we
        // were taking the lock.
        if let Some(elem) = self.find(key_id) {
            self.lock.release();
            return elem.value.swap(value, Ordering::AcqRel);
        }
        let slot = &self.slots[key_id as usize % self.slots.len()];
        let elem = Box::into_raw(Box::new(KtElem {
            key_id,
            dtor,
            value: AtomicPtr::new(value),
            next: AtomicPtr::new(slot.load(Ordering::Relaxed)),
        }));
        slot.store(elem, Ordering::Release);
        self.lock.release();
        ptr::null_mut()
    }

    fn get(&self, key_id: u32) -> *mut () {
        self.find(key_id)
            .map_or(ptr::null_mut(), |elem| elem.value.load(Ordering::Acquire))
    }

    fn take(&self, key_id: u32) -> *mut () {
        self.find(key_id).map_or(ptr::null_mut(), |elem| {
            elem.value.swap(ptr::null_mut(), Ordering::AcqRel)
        })
    }
}

impl Drop for Ktable {
    fn drop(&mut self) {
        for slot in &self.slots {
            let mut cur = slot.load(Ordering::Acquire);
            while let Some(elem_ptr) = NonNull::new(cur) {
                // Safety: the owning unit is being released; nothing else can
                // reach this table.
                let elem = unsafe { Box::from_raw(elem_ptr.as_ptr()) };
                // Clear the value first, then run the destructor.
                let value = elem.value.swap(ptr::null_mut(), Ordering::AcqRel);
                if let (Some(dtor), false) = (elem.dtor, value.is_null()) {
                    // Safety: `dtor` was registered together with this value's
                    // type by `Key::set`.
                    unsafe { dtor(value) };
                }
                cur = elem.next.load(Ordering::Relaxed);
            }
        }
    }
}

/// Lazily get (or create) the keytable of `unit`.
fn table_of(unit: &Unit, create: bool) -> Option<&Ktable> {
    let existing = unit.keytable.load(Ordering::Acquire);
    if let Some(table) = NonNull::new(existing) {
        // Safety: the table lives until the unit is released.
        return Some(unsafe { &*table.as_ptr() });
    }
    if !create {
        return None;
    }
    let fresh = Box::into_raw(Box::new(Ktable::new(global::config().key_table_size)));
    match unit.keytable.compare_exchange(
        ptr::null_mut(),
        fresh,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        // Safety: we just published `fresh`.
        Ok(_) => Some(unsafe { &*fresh }),
        Err(raced) => {
            // Safety: `fresh` lost the race and was never shared.
            drop(unsafe { Box::from_raw(fresh) });
            // Safety: `raced` is the published table.
            Some(unsafe { &*raced })
        }
    }
}

unsafe fn drop_shim<T>(value: *mut ()) {
    // Safety: `value` was produced by `Box::into_raw` for a `T` in
    // `Key::<T>::set`.
    drop(unsafe { Box::from_raw(value.cast::<T>()) });
}

fn current_unit() -> Result<NonNull<Unit>> {
    local::current()
        .and_then(crate::xstream::XstreamInner::current_unit)
        .ok_or(Error::InvalidContext)
}

/// A typed work-unit-local storage key.
///
/// The key itself is plain data; the storage lives with each unit. The value
/// set by a unit persists for that unit's lifetime and is dropped when the
/// unit is freed.
pub struct Key<T> {
    id: u32,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Key<T> {}

impl<T> core::fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Key").field("id", &self.id).finish()
    }
}

impl<T: Send + 'static> Key<T> {
    /// Allocate a fresh key id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: KEY_ID.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// Bind `value` to this key in the calling unit's storage, dropping any
    /// previously bound value.
    pub fn set(&self, value: T) -> Result<()> {
        global::ensure_init()?;
        let unit = current_unit()?;
        // Safety: the current unit is live while this code runs on it.
        let table = table_of(unsafe { unit.as_ref() }, true).expect("keytable creation");
        let boxed = Box::into_raw(Box::new(value)).cast::<()>();
        let old = table.set(self.id, Some(drop_shim::<T>), boxed);
        if !old.is_null() {
            // Safety: the old value was stored by this key with type `T`.
            unsafe { drop_shim::<T>(old) };
        }
        Ok(())
    }

    /// Run `f` with a view of the calling unit's value for this key.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> Result<R> {
        global::ensure_init()?;
        let unit = current_unit()?;
        // Safety: the current unit is live while this code runs on it.
        let value = table_of(unsafe { unit.as_ref() }, false)
            .map_or(ptr::null_mut(), |table| table.get(self.id));
        // Safety: only the owning unit mutates this slot, and it is busy
        // running `f` right now.
        Ok(f(unsafe { value.cast::<T>().as_ref() }))
    }

    /// Remove and return the calling unit's value for this key.
    pub fn take(&self) -> Result<Option<T>> {
        global::ensure_init()?;
        let unit = current_unit()?;
        // Safety: the current unit is live while this code runs on it.
        let value = table_of(unsafe { unit.as_ref() }, false)
            .map_or(ptr::null_mut(), |table| table.take(self.id));
        if value.is_null() {
            return Ok(None);
        }
        // Safety: the value was stored by this key with type `T`.
        Ok(Some(*unsafe { Box::from_raw(value.cast::<T>()) }))
    }
}

impl<T: Send + 'static> Default for Key<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_set_get_roundtrip() {
        let table = Ktable::new(4);
        let a = Box::into_raw(Box::new(11_u32)).cast::<()>();
        let b = Box::into_raw(Box::new(22_u32)).cast::<()>();
        assert!(table.set(3, Some(drop_shim::<u32>), a).is_null());
        assert_eq!(table.get(3), a);
        // Second set returns the replaced pointer.
        assert_eq!(table.set(3, Some(drop_shim::<u32>), b), a);
        assert_eq!(table.get(3), b);
        // Safety: `a` was replaced and is owned by the test again.
        unsafe { drop_shim::<u32>(a) };
        // `b` is freed by the table's destructor pass.
    }

    #[test]
    fn destructor_runs_on_drop() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static DROPS: AtomicU32 = AtomicU32::new(0);

        struct Probe;
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let table = Ktable::new(2);
        for id in 0..4 {
            let value = Box::into_raw(Box::new(Probe)).cast::<()>();
            table.set(id, Some(drop_shim::<Probe>), value);
        }
        drop(table);
        assert_eq!(DROPS.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn take_clears_the_slot() {
        let table = Ktable::new(2);
        let value = Box::into_raw(Box::new(7_i64)).cast::<()>();
        table.set(9, Some(drop_shim::<i64>), value);
        assert_eq!(table.take(9), value);
        assert!(table.take(9).is_null());
        // Safety: ownership came back via `take`.
        unsafe { drop_shim::<i64>(value) };
    }
}
