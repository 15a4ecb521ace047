// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime lifecycle and process-global state.
//!
//! The first [`init`] turns the calling OS thread into the primary execution
//! stream and its call frame into the primary ULT; nested inits bump a
//! refcount. [`finalize`] at the first nesting level must run on the primary
//! ULT: it asks the main scheduler to finish, orphans itself until the root
//! loop hands the thread back, and tears everything down.

use crate::spin::{RawSpinlock, Spinlock, SpinlockGuard};
use crate::unit::{UnitKind, UnitRef, UnitState};
use crate::unit_map::UnitMap;
use crate::xstream::{Xstream, XstreamInner};
use crate::{local, ult, Error, Result};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;
use weft_context::Context;

/// Runtime configuration, read from `WEFT_*` environment variables at init.
#[derive(Debug, Clone)]
pub(crate) struct GlobalConfig {
    /// Slots in a lazily created per-unit keytable (`WEFT_KEY_TABLE_SIZE`).
    pub(crate) key_table_size: usize,
    /// Default ULT stack size in bytes (`WEFT_THREAD_STACKSIZE`).
    pub(crate) thread_stack_size: usize,
    /// Stack size for scheduler and root ULTs (`WEFT_SCHED_STACKSIZE`).
    pub(crate) sched_stack_size: usize,
    /// Pops between scheduler event checks (`WEFT_SCHED_EVENT_FREQ`).
    pub(crate) sched_event_freq: u32,
    /// Scheduler nap length in nanoseconds (`WEFT_SCHED_SLEEP_NSEC`).
    pub(crate) sched_sleep_nsec: u64,
    /// Work-stealing fan-out (`WEFT_MAX_XSTREAMS`).
    pub(crate) max_xstreams: usize,
}

fn env_parse<T: core::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl GlobalConfig {
    fn from_env() -> Self {
        let cores = std::thread::available_parallelism().map_or(4, usize::from);
        Self {
            key_table_size: env_parse("WEFT_KEY_TABLE_SIZE", 4),
            thread_stack_size: env_parse("WEFT_THREAD_STACKSIZE", 128 * 1024),
            sched_stack_size: env_parse("WEFT_SCHED_STACKSIZE", 512 * 1024),
            sched_event_freq: env_parse("WEFT_SCHED_EVENT_FREQ", 50),
            sched_sleep_nsec: env_parse("WEFT_SCHED_SLEEP_NSEC", 100),
            max_xstreams: env_parse("WEFT_MAX_XSTREAMS", cores),
        }
    }
}

pub(crate) struct Global {
    config: GlobalConfig,
    /// All live streams, rank-sorted. Taking a stable snapshot requires
    /// holding the lock across the whole read.
    streams: Spinlock<Vec<Xstream>>,
    primary_ult: Spinlock<Option<UnitRef>>,
    unit_map: UnitMap,
}

/// Guards init/finalize against each other.
static INIT_LOCK: RawSpinlock = RawSpinlock::new();
/// Nesting depth; only touched under `INIT_LOCK`.
static NUM_INITS: AtomicU32 = AtomicU32::new(0);
/// Fast-path initialized flag, release-stored after the runtime is usable.
static INITIALIZED: AtomicU32 = AtomicU32::new(0);
static GLOBAL: AtomicPtr<Global> = AtomicPtr::new(ptr::null_mut());

/// Whether the runtime is initialized.
#[must_use]
pub fn initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire) != 0
}

pub(crate) fn ensure_init() -> Result<()> {
    if initialized() {
        Ok(())
    } else {
        Err(Error::Uninitialized)
    }
}

pub(crate) fn global() -> &'static Global {
    let ptr = GLOBAL.load(Ordering::Acquire);
    // Safety: the pointer is published at init and only retired at finalize,
    // which the caller cannot outrun (all callers run inside the runtime).
    unsafe { ptr.as_ref() }.expect("runtime is not initialized")
}

pub(crate) fn config() -> &'static GlobalConfig {
    &global().config
}

pub(crate) fn unit_map() -> &'static UnitMap {
    &global().unit_map
}

pub(crate) fn streams() -> Vec<Xstream> {
    global().streams.lock().clone()
}

pub(crate) fn streams_guard() -> SpinlockGuard<'static, Vec<Xstream>> {
    global().streams.lock()
}

pub(crate) fn remove_stream(rank: i32) {
    let mut streams = global().streams.lock();
    streams.retain(|xs| xs.rank() != rank);
}

pub(crate) fn primary_unit() -> Option<UnitRef> {
    global().primary_ult.lock().clone()
}

/// Initialize the runtime.
///
/// The first caller becomes the primary ULT on the primary execution stream
/// and gets control back once the stream's scheduling machinery is running.
/// Nested calls only increment a refcount.
pub fn init() -> Result<()> {
    INIT_LOCK.acquire();
    let result = if NUM_INITS.load(Ordering::Relaxed) > 0 {
        NUM_INITS.fetch_add(1, Ordering::Relaxed);
        Ok(())
    } else {
        let result = init_library();
        if result.is_ok() {
            NUM_INITS.fetch_add(1, Ordering::Relaxed);
        }
        result
    };
    INIT_LOCK.release();
    result
}

fn init_library() -> Result<()> {
    let global = Box::new(Global {
        config: GlobalConfig::from_env(),
        streams: Spinlock::new(Vec::new()),
        primary_ult: Spinlock::new(None),
        unit_map: UnitMap::new(),
    });
    GLOBAL.store(Box::into_raw(global), Ordering::Release);

    let cleanup = |err: Error| {
        let ptr = GLOBAL.swap(ptr::null_mut(), Ordering::AcqRel);
        // Safety: we own the freshly published pointer.
        drop(unsafe { Box::from_raw(ptr) });
        local::set_current(ptr::null());
        err
    };

    // The calling thread becomes the primary execution stream.
    let es = Arc::new(XstreamInner::new_primary());
    local::set_current(Arc::as_ptr(&es));
    let xs = Xstream { inner: Arc::clone(&es) };
    self::global().streams.lock().push(xs);

    if let Err(err) = crate::xstream::build_scheduling(&es, None) {
        return Err(cleanup(err));
    }

    // The primary ULT wraps this very call frame; no stack is allocated.
    let main_pool = es
        .main_sched()
        .and_then(|sched| sched.pools().first().cloned())
        .expect("primary stream has no main pool");
    let primary = crate::unit::create_wrapper_ult(
        UnitKind::PRIMARY | UnitKind::NAMED,
        Some(&main_pool),
    );
    primary
        .state
        .store(UnitState::Running as u8, Ordering::Relaxed);
    primary
        .last_stream
        .store(es.as_mut_ptr(), Ordering::Relaxed);
    es.set_current(primary.as_ptr());
    *self::global().primary_ult.lock() = Some(primary.clone());

    // Start the stream: push ourselves (as a READY ULT) into the main pool
    // once our context is saved, and switch into the root ULT. The root
    // dispatches the main scheduler, the main scheduler pops us, and control
    // returns right here.
    let root = es.root_ult.lock().clone().expect("no root ULT");
    es.set_deferred(ult::Deferred::PushReady {
        unit: primary.clone(),
        dec_blocked: None,
    });
    // The root ULT is the running unit from here until the main scheduler
    // dispatches us back.
    es.set_current(root.as_ptr());
    // Safety: the root context is freshly bound; the primary context is this
    // frame.
    unsafe { Context::switch(&primary.yctx().mctx, &root.yctx().mctx) };
    ult::run_deferred_current();

    INITIALIZED.store(1, Ordering::Release);
    tracing::debug!("runtime initialized");
    Ok(())
}

/// Finalize the runtime.
///
/// At the first nesting level this must be called from the primary ULT on
/// the primary execution stream; it waits for the main scheduler to drain
/// and tears the runtime down. At deeper nesting levels it only decrements
/// the refcount.
pub fn finalize() -> Result<()> {
    INIT_LOCK.acquire();
    let result = finalize_library();
    INIT_LOCK.release();
    result
}

fn finalize_library() -> Result<()> {
    if NUM_INITS.load(Ordering::Relaxed) == 0 {
        return Err(Error::Uninitialized);
    }
    if NUM_INITS.fetch_sub(1, Ordering::Relaxed) != 1 {
        return Ok(());
    }

    let restore_nesting = || NUM_INITS.fetch_add(1, Ordering::Relaxed);

    let Some(es) = local::current() else {
        restore_nesting();
        return Err(Error::InvalidContext);
    };
    if !es.is_primary() {
        restore_nesting();
        return Err(Error::InvalidContext);
    }
    let Some(cur) = es.current_unit() else {
        restore_nesting();
        return Err(Error::InvalidContext);
    };
    // Safety: `cur` is this very frame's unit.
    if !unsafe { cur.as_ref() }.kind().contains(UnitKind::PRIMARY) {
        restore_nesting();
        return Err(Error::InvalidContext);
    }

    // Tool callbacks must not observe teardown.
    crate::tool::set_tool_callback(None, crate::tool::ToolEventMask::empty());

    // Ask the main scheduler to finish, then park until the root loop hands
    // the thread back to us. We are orphaned: not in any pool, with no
    // obligation count, resumed only by the root ULT's final jump.
    let sched = es.main_sched().expect("primary stream has no scheduler");
    sched.finish();
    ult::yield_orphan()?;

    let es = local::current().expect("primary stream vanished");
    debug_assert_eq!(es.state(), crate::xstream::XstreamState::Terminated);

    // Tear down the primary stream's machinery.
    drop(es.root_ult.lock().take());
    drop(es.root_pool.lock().take());
    if let Some(sched) = es.take_main_sched() {
        drop(sched.inner.ythread.lock().take());
        drop(sched);
    }
    {
        let mut streams = global().streams.lock();
        debug_assert_eq!(streams.len(), 1, "secondary streams left at finalize");
        streams.clear();
    }
    drop(global().primary_ult.lock().take());
    local::set_current(ptr::null());

    let ptr = GLOBAL.swap(ptr::null_mut(), Ordering::AcqRel);
    if let Some(ptr) = NonNull::new(ptr) {
        // Safety: the runtime is quiesced; nothing can reach the global.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
    INITIALIZED.store(0, Ordering::Release);
    tracing::debug!("runtime finalized");
    Ok(())
}

