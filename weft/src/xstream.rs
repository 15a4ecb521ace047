// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Execution streams.
//!
//! An execution stream (xstream) is one OS-thread-backed scheduling domain:
//! a root ULT that dispatches the stream's main-scheduler ULT out of a
//! private root pool, plus whatever that scheduler then runs. The primary
//! stream wraps the thread that called [`init`](crate::init); secondary
//! streams own a spawned thread that parks between lifetimes so the stream
//! can be revived without re-spawning.

use crate::pool::{Pool, PoolAccess, PoolContext};
use crate::sched::{Sched, SchedConfig, SchedUsed};
use crate::spin::Spinlock;
use crate::ult::Deferred;
use crate::unit::{UnitKind, UnitRef, UnitState};
use crate::{global, local, ult, Error, Result};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use weft_context::Context;

/// Observable stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XstreamState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Terminated = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XstreamKind {
    Primary,
    Secondary,
}

/// Backing-thread lifecycle, after `abtd`'s stream context protocol: the
/// thread runs one root-loop lifetime, then waits for a join, a revival, or
/// a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Running,
    ReqJoin,
    Waiting,
    ReqTerminate,
}

struct OsThread {
    state: Mutex<ThreadState>,
    cond: Condvar,
    handle: Spinlock<Option<JoinHandle<()>>>,
}

pub(crate) struct XstreamInner {
    rank: i32,
    kind: XstreamKind,
    state: AtomicU8,
    main_sched: Spinlock<Option<Sched>>,
    pub(crate) root_ult: Spinlock<Option<UnitRef>>,
    pub(crate) root_pool: Spinlock<Option<Pool>>,
    /// The unit currently running on this stream.
    current: AtomicPtr<crate::unit::Unit>,
    /// The pending deferred action; touched only by code running on this
    /// stream, around its own context switches.
    deferred: UnsafeCell<Option<Deferred>>,
    /// Where a secondary backing thread is suspended while the root ULT
    /// runs.
    anchor: Context,
    thread: OsThread,
}

// Safety: `deferred` is only touched by the single OS thread currently
// backing this stream (around its own context switches); everything else is
// atomic or lock-guarded.
unsafe impl Sync for XstreamInner {}
// Safety: as above.
unsafe impl Send for XstreamInner {}

impl XstreamInner {
    pub(crate) fn new_primary() -> Self {
        Self::new(0, XstreamKind::Primary)
    }

    fn new(rank: i32, kind: XstreamKind) -> Self {
        Self {
            rank,
            kind,
            state: AtomicU8::new(XstreamState::Running as u8),
            main_sched: Spinlock::new(None),
            root_ult: Spinlock::new(None),
            root_pool: Spinlock::new(None),
            current: AtomicPtr::new(ptr::null_mut()),
            deferred: UnsafeCell::new(None),
            anchor: Context::unbound(),
            thread: OsThread {
                state: Mutex::new(ThreadState::Running),
                cond: Condvar::new(),
                handle: Spinlock::new(None),
            },
        }
    }

    pub(crate) fn rank(&self) -> i32 {
        self.rank
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.kind == XstreamKind::Primary
    }

    pub(crate) fn state(&self) -> XstreamState {
        match self.state.load(Ordering::Acquire) {
            0 => XstreamState::Created,
            1 => XstreamState::Ready,
            2 => XstreamState::Running,
            _ => XstreamState::Terminated,
        }
    }

    pub(crate) fn set_state(&self, state: XstreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn current_unit(&self) -> Option<NonNull<crate::unit::Unit>> {
        NonNull::new(self.current.load(Ordering::Relaxed))
    }

    pub(crate) fn set_current(&self, unit: NonNull<crate::unit::Unit>) {
        self.current.store(unit.as_ptr(), Ordering::Relaxed);
    }

    pub(crate) fn set_deferred(&self, action: Deferred) {
        // Safety: owner-thread access, see field docs.
        let slot = unsafe { &mut *self.deferred.get() };
        debug_assert!(slot.is_none(), "deferred action overwritten");
        *slot = Some(action);
    }

    pub(crate) fn take_deferred(&self) -> Option<Deferred> {
        // Safety: owner-thread access, see field docs.
        unsafe { &mut *self.deferred.get() }.take()
    }

    pub(crate) fn main_sched(&self) -> Option<Sched> {
        self.main_sched.lock().clone()
    }

    pub(crate) fn install_main_sched(&self, sched: Sched) {
        *self.main_sched.lock() = Some(sched);
    }

    pub(crate) fn take_main_sched(&self) -> Option<Sched> {
        self.main_sched.lock().take()
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut XstreamInner {
        ptr::from_ref(self).cast_mut()
    }
}

impl fmt::Debug for XstreamInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xstream")
            .field("rank", &self.rank)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Pointer wrapper so root-ULT bodies can capture their stream without
/// keeping it alive (the stream strictly outlives its root ULT).
#[derive(Clone, Copy)]
struct EsPtr(*const XstreamInner);
// Safety: the pointee is Sync and outlives the capture.
unsafe impl Send for EsPtr {}

impl EsPtr {
    fn get(self) -> &'static XstreamInner {
        // Safety: see the type docs.
        unsafe { &*self.0 }
    }
}

/// The root dispatch loop: feed the main-scheduler ULT (the only occupant of
/// the root pool) until it terminates. Runs on the root ULT.
pub(crate) fn root_loop(es: &XstreamInner) {
    debug_assert_eq!(es.state(), XstreamState::Running);
    let root_pool = es
        .root_pool
        .lock()
        .clone()
        .expect("stream has no root pool");

    loop {
        if let Some(unit) = root_pool.inner.pop_unit(PoolContext::OWNER_PRIMARY) {
            ult::schedule(unit);
        }
        let main_host = es
            .main_sched()
            .and_then(|sched| sched.inner.ythread.lock().clone());
        let done = main_host.is_none_or(|host| host.state() == UnitState::Terminated);
        if done {
            break;
        }
    }
    es.set_state(XstreamState::Terminated);
    tracing::debug!(rank = es.rank(), "execution stream terminated");
}

/// Build the root pool, main scheduler (defaulting to `basic_wait` over one
/// MPMC FIFO-wait pool), main-scheduler ULT and root ULT for `es`.
pub(crate) fn build_scheduling(es: &Arc<XstreamInner>, sched: Option<Sched>) -> Result<()> {
    let root_pool = Pool::fifo_internal(PoolAccess::Priv, true);
    *es.root_pool.lock() = Some(root_pool.clone());

    let sched = match sched {
        Some(sched) => sched,
        None => {
            let pool = Pool::fifo_wait_internal(PoolAccess::Mpmc, true);
            Sched::basic_wait_internal(&[pool], &SchedConfig::default())?
        }
    };
    sched.set_used(SchedUsed::Main);
    es.install_main_sched(sched.clone());

    // The main-scheduler ULT lives in the root pool; the root loop dispatches
    // it, and it re-enters the pool only on revival.
    let cfg = global::config();
    let host = crate::unit::create_ult(
        Some(&root_pool),
        Box::new(crate::sched::main_sched_body),
        UnitKind::MAIN_SCHED,
        cfg.sched_stack_size,
        weft_context::StackGuard::Page,
        true,
    )?;
    *sched.inner.ythread.lock() = Some(host);

    // The root ULT: dispatches the main scheduler, then unwinds the stream.
    let es_ptr = EsPtr(Arc::as_ptr(es));
    let is_primary = es.is_primary();
    let body: crate::unit::Body = if is_primary {
        Box::new(move || {
            let es = es_ptr.get();
            root_loop(es);
            // Hand the thread back to the primary ULT, which is suspended in
            // `finalize`.
            let primary = global::primary_unit().expect("primary unit vanished");
            primary
                .state
                .store(UnitState::Running as u8, Ordering::Relaxed);
            es.set_current(primary.as_ptr());
            let primary_ctx: *const Context = &primary.yctx().mctx;
            drop(primary);
            // Safety: the primary ULT suspended itself in finalize; the root
            // context is abandoned for good.
            unsafe { Context::jump(&*primary_ctx) }
        })
    } else {
        Box::new(move || {
            let es = es_ptr.get();
            root_loop(es);
            // Hand the thread back to its anchor so it can park for
            // join/revive/terminate requests.
            // Safety: the anchor was filled when the backing thread switched
            // into this root ULT.
            unsafe { Context::jump(&es.anchor) }
        })
    };
    let root = crate::unit::create_ult(
        Some(&root_pool),
        body,
        UnitKind::ROOT,
        cfg.sched_stack_size,
        weft_context::StackGuard::Page,
        false,
    )?;
    *es.root_ult.lock() = Some(root);
    Ok(())
}

/// Rebind the root ULT for another lifetime (stream revival).
fn rebind_root(es: &Arc<XstreamInner>) -> Result<()> {
    let root = es
        .root_ult
        .lock()
        .clone()
        .ok_or(Error::InvalidState)?;
    let es_ptr = EsPtr(Arc::as_ptr(es));
    let body: crate::unit::Body = Box::new(move || {
        let es = es_ptr.get();
        root_loop(es);
        // Safety: as in `build_scheduling`.
        unsafe { Context::jump(&es.anchor) }
    });
    // Safety: the root ULT is not running (its previous lifetime jumped
    // away) and only this reviver touches it.
    unsafe { *root.body.get() = Some(body) };
    let top = root.yctx().stack.top().ok_or(Error::InvalidState)?;
    // Safety: stack owned by the descriptor; old context is dead.
    unsafe {
        root.yctx()
            .mctx
            .bind(top, ult::ult_entry, root.as_ptr().as_ptr().cast());
    }
    root.state.store(UnitState::Ready as u8, Ordering::Relaxed);
    Ok(())
}

/// Backing-thread main: run root-loop lifetimes separated by parked waits.
fn xstream_thread(es: Arc<XstreamInner>) {
    local::set_current(Arc::as_ptr(&es));
    loop {
        {
            let root = es
                .root_ult
                .lock()
                .clone()
                .expect("stream has no root ULT");
            es.set_current(root.as_ptr());
            // Safety: the root context was bound fresh for this lifetime; the
            // anchor is this thread's own resting place.
            unsafe { Context::switch(&es.anchor, &root.yctx().mctx) };
            ult::run_deferred_current();
        }

        // This lifetime is over; park until freed or revived.
        let mut st = es.thread.state.lock().unwrap();
        if *st == ThreadState::ReqJoin {
            es.thread.cond.notify_all();
        }
        *st = ThreadState::Waiting;
        while *st == ThreadState::Waiting {
            st = es.thread.cond.wait(st).unwrap();
        }
        if *st == ThreadState::ReqTerminate {
            break;
        }
        debug_assert_eq!(*st, ThreadState::Running);
    }
    local::set_current(ptr::null());
}

/// An execution stream handle.
#[derive(Clone, Debug)]
pub struct Xstream {
    pub(crate) inner: Arc<XstreamInner>,
}

impl PartialEq for Xstream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Xstream {}

impl Xstream {
    /// Create a secondary stream with the default main scheduler.
    pub fn create() -> Result<Xstream> {
        Self::create_with_sched(None)
    }

    /// Create a secondary stream driven by `sched`.
    pub fn create_with_sched(sched: Option<&Sched>) -> Result<Xstream> {
        global::ensure_init()?;
        if let Some(sched) = sched {
            if sched.used() != SchedUsed::NotUsed {
                return Err(Error::InvalidState);
            }
        }

        let xs = {
            let mut streams = global::streams_guard();
            let rank = smallest_free_rank(&streams);
            let xs = Xstream {
                inner: Arc::new(XstreamInner::new(rank, XstreamKind::Secondary)),
            };
            let pos = streams
                .binary_search_by_key(&rank, |s| s.inner.rank)
                .unwrap_err();
            streams.insert(pos, xs.clone());
            xs
        };

        if let Err(err) = build_scheduling(&xs.inner, sched.cloned()) {
            global::remove_stream(xs.inner.rank);
            return Err(err);
        }

        let arc = Arc::clone(&xs.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("weft-es-{}", xs.inner.rank))
            .spawn(move || xstream_thread(arc));
        match spawned {
            Ok(handle) => {
                *xs.inner.thread.handle.lock() = Some(handle);
                tracing::debug!(rank = xs.inner.rank, "execution stream created");
                Ok(xs)
            }
            Err(err) => {
                global::remove_stream(xs.inner.rank);
                Err(Error::Sys(err.raw_os_error().unwrap_or(0)))
            }
        }
    }

    /// The stream the caller is running on, if any.
    #[must_use]
    pub fn self_() -> Option<Xstream> {
        let es = local::current()?;
        global::streams()
            .into_iter()
            .find(|xs| ptr::eq(Arc::as_ptr(&xs.inner), es))
    }

    /// All live streams, rank-sorted.
    #[must_use]
    pub fn list() -> Vec<Xstream> {
        global::streams()
    }

    #[must_use]
    pub fn num_xstreams() -> usize {
        global::streams().len()
    }

    #[must_use]
    pub fn rank(&self) -> i32 {
        self.inner.rank
    }

    #[must_use]
    pub fn state(&self) -> XstreamState {
        self.inner.state()
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.inner.is_primary()
    }

    #[must_use]
    pub fn main_sched(&self) -> Option<Sched> {
        self.inner.main_sched()
    }

    /// First pool of the main scheduler.
    #[must_use]
    pub fn main_pool(&self) -> Option<Pool> {
        self.inner.main_sched()?.pools().first().cloned()
    }

    pub(crate) fn inner_ptr(&self) -> *const XstreamInner {
        Arc::as_ptr(&self.inner)
    }

    /// Ask the stream to finish its remaining work and wait for its backing
    /// thread to stop.
    pub fn join(&self) -> Result<()> {
        global::ensure_init()?;
        if self.inner.is_primary() {
            return Err(Error::InvalidArg);
        }
        if let Some(es) = local::current() {
            if ptr::eq(es, Arc::as_ptr(&self.inner)) {
                return Err(Error::InvalidContext);
            }
        }
        if self.state() != XstreamState::Terminated {
            if let Some(sched) = self.main_sched() {
                sched.finish();
            }
        }

        // A yieldable caller cooperates while the stream drains; the final
        // OS-level handshake is brief.
        let on_ult = local::current()
            .and_then(XstreamInner::current_unit)
            // Safety: the current unit is live.
            .is_some_and(|cur| unsafe { cur.as_ref() }.is_yieldable());
        if on_ult {
            while self.state() != XstreamState::Terminated {
                crate::current::yield_now()?;
            }
        }

        let mut st = self.inner.thread.state.lock().unwrap();
        if *st != ThreadState::Waiting {
            *st = ThreadState::ReqJoin;
            while *st == ThreadState::ReqJoin {
                st = self.inner.thread.cond.wait(st).unwrap();
            }
        }
        debug_assert_eq!(*st, ThreadState::Waiting);
        Ok(())
    }

    /// Join, terminate the backing thread, and unregister the stream.
    pub fn free(self) -> Result<()> {
        self.join()?;
        {
            let mut st = self.inner.thread.state.lock().unwrap();
            debug_assert_eq!(*st, ThreadState::Waiting);
            *st = ThreadState::ReqTerminate;
            self.inner.thread.cond.notify_all();
        }
        if let Some(handle) = self.inner.thread.handle.lock().take() {
            let _unused = handle.join();
        }
        global::remove_stream(self.inner.rank);
        tracing::debug!(rank = self.inner.rank, "execution stream freed");
        Ok(())
    }

    /// Restart a terminated stream on its parked backing thread.
    pub fn revive(&self) -> Result<()> {
        global::ensure_init()?;
        if self.state() != XstreamState::Terminated {
            return Err(Error::InvalidState);
        }
        let sched = self.main_sched().ok_or(Error::InvalidState)?;
        sched.inner.request.store(0, Ordering::Release);

        // Revive the main-scheduler ULT into the root pool and re-arm the
        // root ULT.
        let root_pool = self
            .inner
            .root_pool
            .lock()
            .clone()
            .ok_or(Error::InvalidState)?;
        let host = sched
            .inner
            .ythread
            .lock()
            .clone()
            .ok_or(Error::InvalidState)?;
        crate::unit::revive_unit(
            &root_pool,
            Box::new(crate::sched::main_sched_body),
            &host,
            false,
        )?;
        rebind_root(&self.inner)?;
        self.inner.set_state(XstreamState::Running);

        let mut st = self.inner.thread.state.lock().unwrap();
        if *st != ThreadState::Waiting {
            return Err(Error::InvalidState);
        }
        *st = ThreadState::Running;
        self.inner.thread.cond.notify_all();
        tracing::debug!(rank = self.inner.rank, "execution stream revived");
        Ok(())
    }

    /// Install `sched` as this stream's main scheduler.
    ///
    /// Called from a ULT running on this very stream, this stages the atomic
    /// replacement protocol and suspends until the old scheduler has handed
    /// its hosting ULT over. On a terminated stream the swap is direct.
    pub fn set_main_sched(&self, sched: &Sched) -> Result<()> {
        global::ensure_init()?;
        if sched.used() != SchedUsed::NotUsed {
            return Err(Error::InvalidState);
        }
        if sched.num_pools() == 0 {
            return Err(Error::InvalidArg);
        }

        let on_this = local::current().is_some_and(|es| ptr::eq(es, Arc::as_ptr(&self.inner)));
        if on_this {
            let es = local::current().expect("stream vanished");
            let cur = es.current_unit().ok_or(Error::InvalidContext)?;
            // Safety: the current unit is live.
            let cur_u = unsafe { cur.as_ref() };
            if !cur_u.is_yieldable() || cur_u.kind().contains(UnitKind::MAIN_SCHED) {
                return Err(Error::InvalidContext);
            }
            let old = self.main_sched().ok_or(Error::InvalidState)?;
            // Safety: `cur` is live.
            let waiter = unsafe { UnitRef::clone_raw(cur) };
            // The staging happens after our context is saved, so the old
            // scheduler cannot resume us mid-switch; we come back once its
            // event check has performed the swap.
            ult::suspend_with_action(Some(Deferred::ReplaceSched {
                new: sched.clone(),
                old,
                waiter,
            }))?;
            Ok(())
        } else if self.state() == XstreamState::Terminated {
            let old = self.inner.take_main_sched();
            if let Some(old) = &old {
                let host = old.inner.ythread.lock().take();
                *sched.inner.ythread.lock() = host;
                old.set_used(SchedUsed::NotUsed);
            }
            sched.set_used(SchedUsed::Main);
            self.inner.install_main_sched(sched.clone());
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }
}

fn smallest_free_rank(streams: &[Xstream]) -> i32 {
    let mut rank = 0;
    for xs in streams {
        if xs.inner.rank == rank {
            rank += 1;
        } else if xs.inner.rank > rank {
            break;
        }
    }
    rank
}
