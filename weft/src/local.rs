// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-OS-thread runtime context.
//!
//! Each OS thread backing an execution stream records a pointer to its stream
//! descriptor here; threads outside the runtime ("external threads") read
//! `None`. A yieldable unit can resume on a *different* OS thread after a
//! context switch, so this pointer must be re-read after every switch; the
//! accessors below are `#[inline(never)]` so the thread-local address is
//! recomputed on every call instead of being cached across a switch.

use crate::xstream::XstreamInner;
use core::cell::Cell;
use core::ptr;

std::thread_local! {
    static CURRENT_STREAM: Cell<*const XstreamInner> = const { Cell::new(ptr::null()) };
}

#[inline(never)]
pub(crate) fn current() -> Option<&'static XstreamInner> {
    let ptr = CURRENT_STREAM.with(Cell::get);
    // Safety: the pointer is set for the lifetime of the backing OS thread's
    // participation in the runtime (see `set_current`), and stream
    // descriptors outlive every unit that can run on them.
    unsafe { ptr.as_ref() }
}

#[inline(never)]
pub(crate) fn set_current(stream: *const XstreamInner) {
    CURRENT_STREAM.with(|c| c.set(stream));
}
