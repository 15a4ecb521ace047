// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The wait-list: an intrusive FIFO of blocked contexts.
//!
//! Every synchronization object in the runtime (mutex, condvar, rwlock,
//! eventual, future, barrier) is built on this primitive. Waiter nodes live
//! on the blocked context's stack, so enqueueing never allocates. Yieldable
//! waiters suspend their ULT; non-yieldable waiters (external threads,
//! tasklet contexts) and *all* timed waiters sleep on the list's [`ParkGroup`]
//! re-checking their own READY flag, because the group cannot wake a single
//! sleeper selectively and a timed-out waiter must be able to extract itself
//! from the queue.
//!
//! The list head/tail are guarded by a caller-supplied lock: the caller holds
//! it across the enqueue, and a blocked ULT releases it only after its
//! context is saved (see [`ult::suspend_with`]).

use crate::park::ParkGroup;
use crate::spin::RawSpinlock;
use crate::unit::{UnitRef, UnitState};
use crate::{local, ult};
use cordyceps::{list, List, Linked};
use core::cell::UnsafeCell;
use core::marker::PhantomPinned;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

enum WaiterKind {
    /// A suspended ULT; woken by `resume_and_push`.
    Ult(UnitRef),
    /// A passive sleeper on the list's park group (or a yield-polling timed
    /// waiter); woken by flipping `state` to READY.
    Park,
}

/// A waiter node, allocated in the blocked context's stack frame.
struct Waiter {
    /// Intrusive linked list pointers.
    ///
    /// This must be the first field in the struct in order for the `Linked`
    /// implementation to be sound.
    links: UnsafeCell<list::Links<Waiter>>,
    kind: WaiterKind,
    state: AtomicU8,
    _pin: PhantomPinned,
}

impl Waiter {
    fn new(kind: WaiterKind) -> Self {
        Self {
            links: UnsafeCell::new(list::Links::new()),
            kind,
            state: AtomicU8::new(UnitState::Blocked as u8),
            _pin: PhantomPinned,
        }
    }

    fn is_ready(&self, ordering: Ordering) -> bool {
        self.state.load(ordering) == UnitState::Ready as u8
    }
}

// Safety: `links` is the first field; nodes are only linked while their
// owning frame is blocked, and all link manipulation happens under the
// caller-supplied list lock.
unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: `addr_of` avoids creating a reference to the whole node.
        unsafe {
            let links = ptr::addr_of!((*target.as_ptr()).links);
            NonNull::new_unchecked((*links).get())
        }
    }
}

/// An intrusive FIFO of blocked contexts plus the passive-wait channel for
/// its non-yieldable sleepers.
pub(crate) struct WaitList {
    park: ParkGroup,
    queue: UnsafeCell<List<Waiter>>,
}

// Safety: `queue` is only touched under the caller-supplied lock, per the
// safety contracts of the methods below.
unsafe impl Send for WaitList {}
// Safety: as above.
unsafe impl Sync for WaitList {}

impl WaitList {
    pub(crate) fn new() -> Self {
        Self {
            park: ParkGroup::new(),
            queue: UnsafeCell::new(List::new()),
        }
    }

    #[expect(clippy::mut_from_ref, reason = "guarded by the caller-supplied lock")]
    unsafe fn queue(&self) -> &mut List<Waiter> {
        // Safety: per the method contracts, the caller holds the guard lock.
        unsafe { &mut *self.queue.get() }
    }

    /// Enqueue the calling context and block; `lock` is released once the
    /// context can safely be woken, and the call returns unlocked after a
    /// [`signal`]/[`broadcast`] reaches it.
    ///
    /// # Safety
    ///
    /// The caller must hold `lock`, and every other use of this list must be
    /// under the same lock.
    ///
    /// [`signal`]: Self::signal
    /// [`broadcast`]: Self::broadcast
    pub(crate) unsafe fn wait_and_unlock(&self, lock: &RawSpinlock) {
        debug_assert!(lock.is_locked());
        if let Some(cur) = yieldable_current() {
            // Safety: `cur` is the caller's own live descriptor.
            let waiter = Waiter::new(WaiterKind::Ult(unsafe { UnitRef::clone_raw(cur) }));
            // Safety: caller holds the lock.
            unsafe { self.queue().push_back(NonNull::from(&waiter)) };
            // The node lives in this frame; the frame stays alive while the
            // ULT is suspended, and the signaller dequeues the node before
            // waking us.
            ult::suspend_with(ptr::from_ref(lock)).expect("yieldable context vanished");
        } else {
            // External thread or tasklet context: sleep on the park group.
            let waiter = Waiter::new(WaiterKind::Park);
            // Safety: caller holds the lock.
            unsafe { self.queue().push_back(NonNull::from(&waiter)) };
            loop {
                // Re-check under the lock before sleeping; the flag may have
                // been set while we were re-acquiring it.
                if waiter.is_ready(Ordering::Relaxed) {
                    lock.release();
                    break;
                }
                self.park.wait_and_unlock(lock);
                if waiter.is_ready(Ordering::Acquire) {
                    break;
                }
                lock.acquire();
            }
        }
    }

    /// As [`wait_and_unlock`], bounded by an absolute deadline. Returns
    /// `true` if the wait timed out, in which case the waiter has extracted
    /// itself from the queue.
    ///
    /// Timed waiters always use a park-style node: a suspended ULT could not
    /// self-extract when its deadline fires, so yieldable timed waiters poll
    /// with plain yields instead of suspending.
    ///
    /// # Safety
    ///
    /// As for [`wait_and_unlock`].
    ///
    /// [`wait_and_unlock`]: Self::wait_and_unlock
    pub(crate) unsafe fn wait_timed_and_unlock(
        &self,
        lock: &RawSpinlock,
        deadline: Instant,
    ) -> bool {
        debug_assert!(lock.is_locked());
        let waiter = Waiter::new(WaiterKind::Park);
        let wptr = NonNull::from(&waiter);
        // Safety: caller holds the lock.
        unsafe { self.queue().push_back(wptr) };

        if let Some(cur) = yieldable_current() {
            lock.release();
            loop {
                if waiter.is_ready(Ordering::Acquire) {
                    return false;
                }
                if Instant::now() >= deadline {
                    lock.acquire();
                    break;
                }
                ult::yield_now_internal(cur);
            }
        } else {
            loop {
                if Instant::now() >= deadline {
                    // Lock is held at the top of this loop.
                    break;
                }
                if waiter.is_ready(Ordering::Relaxed) {
                    lock.release();
                    return false;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.park.wait_timed_and_unlock(lock, remaining);
                if waiter.is_ready(Ordering::Acquire) {
                    return false;
                }
                lock.acquire();
            }
        }

        // Deadline passed; the lock is held. The signal may still have won.
        let timed_out = !waiter.is_ready(Ordering::Relaxed);
        if timed_out {
            // Safety: the node is still linked (nobody dequeued it) and the
            // caller holds the lock.
            unsafe { self.queue().remove(wptr) };
        }
        lock.release();
        timed_out
    }

    /// Wake the first waiter, if any.
    ///
    /// # Safety
    ///
    /// The caller must hold the list's guard lock.
    pub(crate) unsafe fn signal(&self) {
        // Safety: caller holds the lock.
        let Some(node) = (unsafe { self.queue().pop_front() }) else {
            return;
        };
        // Safety: the node is valid until its waiter observes READY (or is
        // pushed), which only happens below.
        let node = unsafe { node.as_ref() };
        match &node.kind {
            WaiterKind::Ult(unit) => {
                let unit = unit.clone();
                // After the push the woken ULT may run and pop the frame
                // holding the node; it must not be touched again.
                ult::resume_and_push(unit);
            }
            WaiterKind::Park => {
                node.state.store(UnitState::Ready as u8, Ordering::Release);
                // The group cannot wake one sleeper selectively: everyone
                // wakes, re-checks their own flag, and the rest sleep again.
                self.park.broadcast();
            }
        }
    }

    /// Wake every waiter.
    ///
    /// # Safety
    ///
    /// The caller must hold the list's guard lock.
    pub(crate) unsafe fn broadcast(&self) {
        let mut wake_park = false;
        // Safety: caller holds the lock.
        while let Some(node) = unsafe { self.queue().pop_front() } {
            // Safety: as in `signal`.
            let node = unsafe { node.as_ref() };
            match &node.kind {
                WaiterKind::Ult(unit) => {
                    let unit = unit.clone();
                    ult::resume_and_push(unit);
                }
                WaiterKind::Park => {
                    node.state.store(UnitState::Ready as u8, Ordering::Release);
                    wake_park = true;
                }
            }
        }
        if wake_park {
            self.park.broadcast();
        }
    }

    /// # Safety
    ///
    /// The caller must hold the list's guard lock.
    pub(crate) unsafe fn is_empty(&self) -> bool {
        // Safety: caller holds the lock.
        unsafe { self.queue().is_empty() }
    }
}

fn yieldable_current() -> Option<NonNull<crate::unit::Unit>> {
    let cur = local::current()?.current_unit()?;
    // Safety: `cur` is the caller's own live descriptor.
    unsafe { cur.as_ref() }.is_yieldable().then_some(cur)
}
