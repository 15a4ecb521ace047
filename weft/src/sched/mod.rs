// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Schedulers.
//!
//! A scheduler owns one or more pools and a `run` loop that pops and
//! dispatches units until it is told to stop. Schedulers are themselves
//! hosted on ULTs, which is what makes them stackable: the unit a scheduler
//! dispatches may itself host another scheduler. The *main* scheduler of an
//! execution stream is special only in that the stream's root ULT dispatches
//! it and that it can be replaced in place (see [`check_events`]).

mod basic;
mod basic_wait;

use crate::pool::{Pool, PoolContext};
use crate::spin::Spinlock;
use crate::unit::{UnitKind, UnitRef, Ult};
use crate::{global, local, ult, Error, Result};
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use core::time::Duration;
use std::sync::{Arc, Weak};
use weft_context::StackGuard;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SchedRequest: u32 {
        /// Stop once every pool is drained.
        const FINISH = 1 << 0;
        /// Stop regardless of remaining work.
        const EXIT = 1 << 1;
        /// A replacement main scheduler is staged.
        const REPLACE = 1 << 2;
    }
}

/// How a scheduler is currently used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedUsed {
    NotUsed = 0,
    Main = 1,
    InPool = 2,
}

/// Which built-in (or user) implementation a scheduler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchedKind {
    Basic,
    BasicWait,
    Custom,
}

/// Scheduler construction parameters. Unset fields fall back to the runtime
/// configuration.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// How many pops happen between event checks.
    pub event_freq: Option<u32>,
    /// Whether the runtime releases the scheduler when its hosting ULT ends.
    pub automatic: bool,
    /// How long `basic` sleeps when a full sweep found nothing.
    pub sleep_nsec: Option<u64>,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            event_freq: None,
            automatic: true,
            sleep_nsec: None,
        }
    }
}

/// User-suppliable scheduler operations.
pub trait SchedOps: Send + Sync {
    /// One-time setup at creation.
    fn init(&self, _sched: &Sched) -> Result<()> {
        Ok(())
    }

    /// The scheduling loop. Must call
    /// [`current::check_events`](crate::current::check_events) periodically
    /// and return once [`Sched::has_to_stop`] reports true.
    fn run(&self, sched: &Sched);

    /// Teardown, run when the scheduler descriptor is released.
    fn free(&self) {}

    /// The pool migrating units should land in.
    fn migration_pool(&self, sched: &Sched, _from: &Pool) -> Option<Pool> {
        sched.pools().first().cloned()
    }
}

struct ReplaceReq {
    sched: Sched,
    waiter: UnitRef,
}

pub(crate) struct SchedInner {
    kind: SchedKind,
    automatic: bool,
    used: AtomicU8,
    pub(crate) request: AtomicU32,
    pools: Vec<Pool>,
    /// The ULT hosting this scheduler's run loop.
    pub(crate) ythread: Spinlock<Option<UnitRef>>,
    replace: Spinlock<Option<ReplaceReq>>,
    ops: Box<dyn SchedOps>,
    pub(crate) event_freq: u32,
    pub(crate) sleep: Duration,
}

impl Drop for SchedInner {
    fn drop(&mut self) {
        for pool in &self.pools {
            pool.inner.release_sched();
        }
        self.ops.free();
    }
}

impl fmt::Debug for SchedInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sched")
            .field("kind", &self.kind)
            .field("used", &self.used.load(Ordering::Relaxed))
            .field("num_pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

/// A scheduler handle.
#[derive(Clone, Debug)]
pub struct Sched {
    pub(crate) inner: Arc<SchedInner>,
}

impl PartialEq for Sched {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Sched {}

impl Sched {
    pub(crate) fn create(
        kind: SchedKind,
        ops: Box<dyn SchedOps>,
        pools: &[Pool],
        config: &SchedConfig,
    ) -> Result<Sched> {
        if pools.is_empty() {
            return Err(Error::InvalidArg);
        }
        let mut pools = pools.to_vec();
        // Sort pools by access mode so private pools are drained first.
        pools.sort_by_key(|pool| pool.access().sort_rank());
        for pool in &pools {
            pool.inner.retain();
        }
        let cfg = global::config();
        let sched = Sched {
            inner: Arc::new(SchedInner {
                kind,
                automatic: config.automatic,
                used: AtomicU8::new(SchedUsed::NotUsed as u8),
                request: AtomicU32::new(0),
                pools,
                ythread: Spinlock::new(None),
                replace: Spinlock::new(None),
                ops,
                event_freq: config.event_freq.unwrap_or(cfg.sched_event_freq).max(1),
                sleep: Duration::from_nanos(config.sleep_nsec.unwrap_or(cfg.sched_sleep_nsec)),
            }),
        };
        sched.inner.ops.init(&sched)?;
        Ok(sched)
    }

    /// The built-in pop-and-dispatch scheduler.
    pub fn basic(pools: &[Pool], config: &SchedConfig) -> Result<Sched> {
        global::ensure_init()?;
        Self::basic_internal(pools, config)
    }

    pub(crate) fn basic_internal(pools: &[Pool], config: &SchedConfig) -> Result<Sched> {
        Self::create(SchedKind::Basic, Box::new(basic::BasicSched), pools, config)
    }

    pub(crate) fn basic_wait_internal(pools: &[Pool], config: &SchedConfig) -> Result<Sched> {
        Self::create(
            SchedKind::BasicWait,
            Box::new(basic_wait::BasicWaitSched),
            pools,
            config,
        )
    }

    /// The built-in scheduler that parks on its first pool's `pop_wait`
    /// instead of sleeping.
    pub fn basic_wait(pools: &[Pool], config: &SchedConfig) -> Result<Sched> {
        global::ensure_init()?;
        Self::basic_wait_internal(pools, config)
    }

    /// A scheduler with user-supplied operations.
    pub fn custom(ops: Box<dyn SchedOps>, pools: &[Pool], config: &SchedConfig) -> Result<Sched> {
        global::ensure_init()?;
        Self::create(SchedKind::Custom, ops, pools, config)
    }

    #[must_use]
    pub fn kind(&self) -> SchedKind {
        self.inner.kind
    }

    #[must_use]
    pub fn used(&self) -> SchedUsed {
        match self.inner.used.load(Ordering::Acquire) {
            1 => SchedUsed::Main,
            2 => SchedUsed::InPool,
            _ => SchedUsed::NotUsed,
        }
    }

    pub(crate) fn set_used(&self, used: SchedUsed) {
        self.inner.used.store(used as u8, Ordering::Release);
    }

    #[must_use]
    pub fn num_pools(&self) -> usize {
        self.inner.pools.len()
    }

    #[must_use]
    pub fn pools(&self) -> &[Pool] {
        &self.inner.pools
    }

    #[must_use]
    pub fn automatic(&self) -> bool {
        self.inner.automatic
    }

    /// Ask the scheduler to stop once its pools are drained.
    pub fn finish(&self) {
        self.inner
            .request
            .fetch_or(SchedRequest::FINISH.bits(), Ordering::Release);
    }

    /// Ask the scheduler to stop regardless of remaining work.
    pub fn exit(&self) {
        self.inner
            .request
            .fetch_or(SchedRequest::EXIT.bits(), Ordering::Release);
    }

    pub(crate) fn requests(&self) -> SchedRequest {
        SchedRequest::from_bits_retain(self.inner.request.load(Ordering::Acquire))
    }

    /// Whether any associated pool still owes work (queued or blocked-out).
    #[must_use]
    pub fn has_unit(&self) -> bool {
        self.inner.pools.iter().any(|pool| pool.inner.has_units())
    }

    /// True when an EXIT was requested, or a FINISH was requested and every
    /// pool reports no work units.
    #[must_use]
    pub fn has_to_stop(&self) -> bool {
        let req = self.requests();
        if req.contains(SchedRequest::EXIT) {
            return true;
        }
        req.contains(SchedRequest::FINISH) && !self.has_unit()
    }

    /// The pool a unit migrating to this scheduler should land in.
    #[must_use]
    pub fn migration_pool(&self, from: &Pool) -> Option<Pool> {
        let target = self.inner.ops.migration_pool(self, from)?;
        // A target the unit is already in is no target at all.
        (target != *from).then_some(target)
    }

    /// Host this scheduler on a fresh ULT pushed into `pool`, making it a
    /// stackable scheduler: it runs when some other scheduler dispatches
    /// that ULT.
    pub fn spawn_on(&self, pool: &Pool) -> Result<Ult> {
        global::ensure_init()?;
        if self.used() != SchedUsed::NotUsed {
            return Err(Error::InvalidState);
        }
        self.set_used(SchedUsed::InPool);
        let weak = Arc::downgrade(&self.inner);
        let r = crate::unit::create_ult(
            Some(pool),
            Box::new(move || run_stacked(&weak)),
            UnitKind::NAMED,
            global::config().sched_stack_size,
            StackGuard::Page,
            true,
        )?;
        *self.inner.ythread.lock() = Some(r.clone());
        Ok(Ult { r })
    }

    /// Stage `self` as the replacement for `old`, the running main scheduler
    /// of the calling stream, and suspend until the swap completes.
    pub(crate) fn request_replace(&self, old: &Sched, waiter: UnitRef) {
        *old.inner.replace.lock() = Some(ReplaceReq {
            sched: self.clone(),
            waiter,
        });
        old.inner
            .request
            .fetch_or(SchedRequest::REPLACE.bits(), Ordering::Release);
    }
}

fn run_stacked(weak: &Weak<SchedInner>) {
    let Some(inner) = weak.upgrade() else { return };
    let sched = Sched { inner };
    sched.inner.ops.run(&sched);
    sched.set_used(SchedUsed::NotUsed);
    *sched.inner.ythread.lock() = None;
}

/// Process scheduler events: called by every run loop once per
/// `event_freq` pops.
///
/// The one event that matters is the main-scheduler replacement protocol: a
/// caller staged a replacement (see [`crate::xstream::Xstream::set_main_sched`]),
/// set the REPLACE bit and suspended itself. The old scheduler transfers its
/// hosting ULT to the replacement, installs it as the stream's main
/// scheduler, marks itself EXIT so its `run` returns, and resumes the
/// waiter. Across the swap the hosting ULT identity is preserved, so the
/// stream always has exactly one scheduler ULT.
pub(crate) fn check_events(sched: &Sched) {
    // A stacked scheduler shares its stream with the scheduler that
    // dispatched it; give that dispatcher a turn between sweeps.
    let stacked = local::current()
        .and_then(crate::xstream::XstreamInner::current_unit)
        // Safety: the current unit is live while this code runs on it.
        .is_some_and(|cur| !unsafe { cur.as_ref() }.kind().contains(UnitKind::MAIN_SCHED));
    if stacked {
        let _unused = ult::yield_now();
    }

    if !sched.requests().contains(SchedRequest::REPLACE) {
        return;
    }
    let Some(req) = sched.inner.replace.lock().take() else {
        return;
    };
    let es = local::current().expect("scheduler event check outside a stream");
    let ReplaceReq { sched: new, waiter } = req;

    new.set_used(SchedUsed::Main);
    // The replacement inherits the hosting ULT.
    let host = sched.inner.ythread.lock().take();
    *new.inner.ythread.lock() = host;
    es.install_main_sched(new);
    sched.set_used(SchedUsed::NotUsed);
    // Force the old run loop to return; the hosting ULT then picks up the
    // new main scheduler. The descriptor itself is reclaimed once this
    // `run` frame is gone (it holds the last reference when automatic).
    sched.inner.request.fetch_or(
        SchedRequest::EXIT.bits(),
        Ordering::Release,
    );
    sched
        .inner
        .request
        .fetch_and(!SchedRequest::REPLACE.bits(), Ordering::Release);
    tracing::debug!("main scheduler replaced");

    ult::resume_and_push(waiter);
}

/// Body of every main-scheduler ULT. Runs whatever the stream's current main
/// scheduler is, re-reading it after every `run` return so an in-place
/// replacement continues seamlessly on the same hosting ULT.
pub(crate) fn main_sched_body() {
    loop {
        let es = local::current().expect("main scheduler outside a stream");
        let sched = es.main_sched().expect("stream lost its main scheduler");
        sched.inner.ops.run(&sched);

        let es = local::current().expect("main scheduler resumed off-stream");
        let sched = es.main_sched().expect("stream lost its main scheduler");

        // A cancel on the hosting ULT ends the stream regardless of work.
        let host_cancelled = es.current_unit().is_some_and(|cur| {
            // Safety: `cur` is this very ULT.
            unsafe { cur.as_ref() }
                .requests()
                .contains(crate::unit::Request::CANCEL)
        });
        if host_cancelled {
            break;
        }
        // A finish request ends the stream once all pools are drained. An
        // exit request ends it regardless of remaining work. (A replacement
        // sets EXIT on the *old* scheduler only; `sched` here is already the
        // replacement, so the stream keeps going.)
        if sched.requests().contains(SchedRequest::FINISH) && !sched.has_unit() {
            break;
        }
        if sched.requests().contains(SchedRequest::EXIT) {
            break;
        }
    }
}

/// Pop-and-dispatch sweep shared by the built-in run loops. Returns whether
/// anything was dispatched.
fn sweep_once(sched: &Sched) -> bool {
    for pool in sched.pools() {
        if let Some(unit) = pool.inner.pop_unit(PoolContext::OP_POOL_OTHER) {
            ult::schedule(unit);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSched;
    impl SchedOps for NoopSched {
        fn run(&self, _sched: &Sched) {}
    }

    #[test]
    fn stop_conditions() {
        // Exercises request-bit logic without a runtime: build the inner
        // record directly.
        let sched = Sched {
            inner: Arc::new(SchedInner {
                kind: SchedKind::Custom,
                automatic: true,
                used: AtomicU8::new(SchedUsed::NotUsed as u8),
                request: AtomicU32::new(0),
                pools: Vec::new(),
                ythread: Spinlock::new(None),
                replace: Spinlock::new(None),
                ops: Box::new(NoopSched),
                event_freq: 8,
                sleep: Duration::from_nanos(100),
            }),
        };
        assert!(!sched.has_to_stop());
        sched.finish();
        // No pools at all: finish with nothing queued stops.
        assert!(sched.has_to_stop());
        sched.exit();
        assert!(sched.has_to_stop());
    }
}
