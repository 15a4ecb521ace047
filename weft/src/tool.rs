// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tool-event callback interface.
//!
//! The runtime emits an event at every work-unit lifecycle edge through an
//! opaque process-global hook. The hook runs on the emitting context and must
//! not perform operations that context-switch the calling unit; registration
//! is safe from within a callback (the registry lock is never held across the
//! call).

use crate::spin::RawSpinlock;
use crate::unit::{AnyUnit, Unit, UnitRef};
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A work-unit lifecycle edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ToolEventKind {
    Create,
    Revive,
    Run,
    Finish,
    Yield,
    Suspend,
    Resume,
    Free,
    Cancel,
    Join,
}

bitflags! {
    /// Which events a registered callback receives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ToolEventMask: u64 {
        const CREATE = 1 << 0;
        const REVIVE = 1 << 1;
        const RUN = 1 << 2;
        const FINISH = 1 << 3;
        const YIELD = 1 << 4;
        const SUSPEND = 1 << 5;
        const RESUME = 1 << 6;
        const FREE = 1 << 7;
        const CANCEL = 1 << 8;
        const JOIN = 1 << 9;
    }
}

impl ToolEventKind {
    fn mask_bit(self) -> ToolEventMask {
        match self {
            ToolEventKind::Create => ToolEventMask::CREATE,
            ToolEventKind::Revive => ToolEventMask::REVIVE,
            ToolEventKind::Run => ToolEventMask::RUN,
            ToolEventKind::Finish => ToolEventMask::FINISH,
            ToolEventKind::Yield => ToolEventMask::YIELD,
            ToolEventKind::Suspend => ToolEventMask::SUSPEND,
            ToolEventKind::Resume => ToolEventMask::RESUME,
            ToolEventKind::Free => ToolEventMask::FREE,
            ToolEventKind::Cancel => ToolEventMask::CANCEL,
            ToolEventKind::Join => ToolEventMask::JOIN,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ToolEventKind::Create => "create",
            ToolEventKind::Revive => "revive",
            ToolEventKind::Run => "run",
            ToolEventKind::Finish => "finish",
            ToolEventKind::Yield => "yield",
            ToolEventKind::Suspend => "suspend",
            ToolEventKind::Resume => "resume",
            ToolEventKind::Free => "free",
            ToolEventKind::Cancel => "cancel",
            ToolEventKind::Join => "join",
        }
    }
}

pub type ToolCallback = dyn Fn(ToolEventKind, &AnyUnit) + Send + Sync;

struct Registry {
    writer_lock: RawSpinlock,
    callback: UnsafeCell<Option<Arc<ToolCallback>>>,
    mask: AtomicU64,
}

// Safety: `callback` is only touched under `writer_lock` (writers) or cloned
// out under it (readers in `emit`).
unsafe impl Sync for Registry {}

static REGISTRY: Registry = Registry {
    writer_lock: RawSpinlock::new(),
    callback: UnsafeCell::new(None),
    mask: AtomicU64::new(0),
};

/// Install (or clear) the process-global tool callback.
pub fn set_tool_callback(callback: Option<Arc<ToolCallback>>, mask: ToolEventMask) {
    REGISTRY.writer_lock.acquire();
    let mask = if callback.is_some() {
        mask.bits()
    } else {
        ToolEventMask::empty().bits()
    };
    // Store an empty mask first so emitters racing this update never invoke a
    // torn (old-callback, new-mask) pair.
    REGISTRY.mask.store(0, Ordering::Release);
    // Safety: holding writer_lock.
    unsafe { *REGISTRY.callback.get() = callback };
    REGISTRY.mask.store(mask, Ordering::Release);
    REGISTRY.writer_lock.release();
}

#[inline]
pub(crate) fn emit(kind: ToolEventKind, unit: &Unit) {
    tracing::trace!(event = kind.as_str(), id = unit.id(), "unit event");
    if REGISTRY.mask.load(Ordering::Acquire) & kind.mask_bit().bits() == 0 {
        return;
    }
    emit_slow(kind, unit);
}

#[cold]
fn emit_slow(kind: ToolEventKind, unit: &Unit) {
    REGISTRY.writer_lock.acquire();
    // Safety: holding writer_lock.
    let callback = unsafe { (*REGISTRY.callback.get()).clone() };
    REGISTRY.writer_lock.release();

    if let Some(callback) = callback {
        // Safety: `unit` is a live descriptor; cloning its reference keeps it
        // live for the duration of the callback.
        let handle = AnyUnit::from_ref(unsafe { UnitRef::clone_raw(NonNull::from(unit)) });
        callback(kind, &handle);
    }
}
