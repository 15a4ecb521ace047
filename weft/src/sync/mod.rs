// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization objects.
//!
//! All of these block cooperatively: a waiting ULT suspends and its stream
//! keeps scheduling other units, while external threads and tasklet contexts
//! park passively on the underlying wait-list's futex channel. Every object
//! here is a thin state machine over [`WaitList`](crate::waitlist::WaitList).

mod barrier;
mod cond;
mod eventual;
mod future;
mod mutex;
mod rwlock;
mod stream_barrier;

pub use barrier::Barrier;
pub use cond::Condvar;
pub use eventual::Eventual;
pub use future::Future;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use stream_barrier::XstreamBarrier;

use crate::local;
use crate::xstream::XstreamInner;
use core::sync::atomic::{AtomicU64, Ordering};

/// An identity for lock ownership tracking: the unit id for work units, a
/// synthetic per-thread id for external threads.
pub(crate) fn self_id() -> u64 {
    if let Some(cur) = local::current().and_then(XstreamInner::current_unit) {
        // Safety: the current unit is live while this code runs on it.
        return unsafe { cur.as_ref() }.id();
    }
    static NEXT_EXT_ID: AtomicU64 = AtomicU64::new(1);
    std::thread_local! {
        static EXT_ID: u64 = NEXT_EXT_ID.fetch_add(1, Ordering::Relaxed) | (1 << 63);
    }
    EXT_ID.with(|id| *id)
}
