// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Token-to-descriptor map for user-defined pools.
//!
//! User-defined pools traffic in opaque `u64` tokens of their own choosing;
//! when the runtime pops a token it resolves it back to the descriptor here.
//! The map is a fixed array of chained slots: mutation takes the slot's
//! spinlock, reads walk the chain lock-free with acquire loads. A token is
//! only removed by the thread that popped it from its pool, so a removed
//! entry can never be raced by a reader of the same token.

use crate::spin::RawSpinlock;
use crate::unit::UnitRef;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

const MAP_SIZE: usize = 256;

struct MapEntry {
    token: u64,
    unit: UnitRef,
    next: AtomicPtr<MapEntry>,
}

struct Slot {
    lock: RawSpinlock,
    head: AtomicPtr<MapEntry>,
}

pub(crate) struct UnitMap {
    slots: Box<[Slot]>,
}

// Safety: slots are internally synchronized (spinlock for writes, acquire
// walks for reads).
unsafe impl Send for UnitMap {}
// Safety: as above.
unsafe impl Sync for UnitMap {}

fn slot_index(token: u64) -> usize {
    let mixed = (token ^ (token >> 32)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    usize::try_from(mixed >> 56).unwrap_or(0) % MAP_SIZE
}

impl UnitMap {
    pub(crate) fn new() -> Self {
        let slots = (0..MAP_SIZE)
            .map(|_| Slot {
                lock: RawSpinlock::new(),
                head: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();
        Self { slots }
    }

    pub(crate) fn insert(&self, token: u64, unit: UnitRef) {
        let slot = &self.slots[slot_index(token)];
        let entry = Box::into_raw(Box::new(MapEntry {
            token,
            unit,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        slot.lock.acquire();
        // Safety: we own `entry` until it is published below.
        unsafe {
            (*entry)
                .next
                .store(slot.head.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        slot.head.store(entry, Ordering::Release);
        slot.lock.release();
    }

    pub(crate) fn get(&self, token: u64) -> Option<UnitRef> {
        let slot = &self.slots[slot_index(token)];
        let mut cur = slot.head.load(Ordering::Acquire);
        while let Some(entry) = NonNull::new(cur) {
            // Safety: published entries stay live until removed by the popper
            // of this token (see module docs).
            let entry = unsafe { entry.as_ref() };
            if entry.token == token {
                return Some(entry.unit.clone());
            }
            cur = entry.next.load(Ordering::Acquire);
        }
        None
    }

    pub(crate) fn remove(&self, token: u64) -> Option<UnitRef> {
        let slot = &self.slots[slot_index(token)];
        slot.lock.acquire();
        let mut prev: Option<NonNull<MapEntry>> = None;
        let mut cur = slot.head.load(Ordering::Relaxed);
        while let Some(entry_ptr) = NonNull::new(cur) {
            // Safety: holding the slot lock.
            let entry = unsafe { entry_ptr.as_ref() };
            if entry.token == token {
                let next = entry.next.load(Ordering::Relaxed);
                match prev {
                    // Safety: holding the slot lock.
                    Some(prev) => unsafe { prev.as_ref() }.next.store(next, Ordering::Release),
                    None => slot.head.store(next, Ordering::Release),
                }
                slot.lock.release();
                // Safety: the entry is unlinked and, per the module contract,
                // no reader can still be resolving this token.
                let boxed = unsafe { Box::from_raw(entry_ptr.as_ptr()) };
                return Some(boxed.unit);
            }
            prev = Some(entry_ptr);
            cur = entry.next.load(Ordering::Relaxed);
        }
        slot.lock.release();
        None
    }
}

impl Drop for UnitMap {
    fn drop(&mut self) {
        for slot in &self.slots {
            let mut cur = slot.head.load(Ordering::Acquire);
            while !cur.is_null() {
                // Safety: dropping the map means no more readers exist.
                let boxed = unsafe { Box::from_raw(cur) };
                cur = boxed.next.load(Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Unit, UnitKind};

    fn dummy_unit() -> UnitRef {
        UnitRef::alloc(Unit::new(UnitKind::THREAD, None, None, None))
    }

    #[test]
    fn insert_get_remove() {
        let map = UnitMap::new();
        let unit = dummy_unit();
        map.insert(7, unit.clone());
        assert!(map.get(7).is_some_and(|u| u.ptr_eq(&unit)));
        assert!(map.get(8).is_none());
        assert!(map.remove(7).is_some());
        assert!(map.get(7).is_none());
        assert!(map.remove(7).is_none());
    }

    #[test]
    fn colliding_tokens_chain() {
        let map = UnitMap::new();
        let a = dummy_unit();
        let b = dummy_unit();
        // Same slot by construction: tokens differing only in bits that the
        // hash may fold together still must resolve exactly.
        map.insert(1, a.clone());
        map.insert(1 + (MAP_SIZE as u64) << 1, b.clone());
        assert!(map.get(1).is_some_and(|u| u.ptr_eq(&a)));
        map.remove(1);
        assert!(map.get(1).is_none());
    }
}
