// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test-and-set spinlock.
//!
//! This is the lowest-level lock in the runtime; it never parks and never
//! yields. Critical sections guarded by it must be short and must not context
//! switch.

// Plain core atomics (not the loom shim): spinlocks back process-global
// statics and therefore need `const` constructors under every cfg.
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Exponential backoff for spin loops.
#[derive(Debug)]
pub(crate) struct Backoff {
    exp: u32,
}

impl Backoff {
    const MAX_EXP: u32 = 8;

    pub(crate) const fn new() -> Self {
        Self { exp: 0 }
    }

    #[inline]
    pub(crate) fn spin(&mut self) {
        for _ in 0..(1 << self.exp) {
            core::hint::spin_loop();
        }
        if self.exp < Self::MAX_EXP {
            self.exp += 1;
        }
    }
}

/// The raw test-and-set lock word.
///
/// `release` has release semantics, `acquire`/`try_acquire` have acquire
/// semantics; `is_locked` is a relaxed observation only.
#[derive(Debug)]
pub(crate) struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    pub(crate) const fn new() -> RawSpinlock {
        RawSpinlock {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn acquire(&self) {
        let mut boff = Backoff::new();
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
        }
    }

    #[inline]
    pub(crate) fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Data guarded by a [`RawSpinlock`].
pub(crate) struct Spinlock<T: ?Sized> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

/// An RAII guard for [`Spinlock`]; the lock is released on drop.
#[must_use = "if unused the Spinlock will immediately unlock"]
pub(crate) struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: the lock provides the required mutual exclusion.
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
// Safety: as above.
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub(crate) const fn new(val: T) -> Spinlock<T> {
        Spinlock {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    #[inline]
    pub(crate) fn lock(&self) -> SpinlockGuard<'_, T> {
        self.raw.acquire();
        SpinlockGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinlockGuard {
                lock: self,
                marker: PhantomData,
            })
        } else {
            None
        }
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Spinlock").field("data", &&*guard).finish(),
            None => f.debug_struct("Spinlock").field("data", &"<locked>").finish(),
        }
    }
}

impl<'a, T: ?Sized + 'a> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for SpinlockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized + 'a> Drop for SpinlockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_lock_cycle() {
        let lock = RawSpinlock::new();
        assert!(!lock.is_locked());
        lock.acquire();
        assert!(lock.is_locked());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn guarded_data() {
        let lock = Spinlock::new(41);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn contended_counter() {
        use crate::loom::sync::Arc;
        use crate::loom::thread;

        crate::loom::model(|| {
            let lock = Arc::new(Spinlock::new(0_u32));
            let joins: Vec<_> = (0..2)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    thread::spawn(move || {
                        *lock.lock() += 1;
                    })
                })
                .collect();
            for join in joins {
                join.join().unwrap();
            }
            assert_eq!(*lock.lock(), 2);
        });
    }
}
