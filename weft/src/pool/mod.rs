// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pluggable pools of ready work units.
//!
//! A pool is an opaque container with a required push/pop/is_empty core and a
//! set of optional operations advertised through [`PoolCaps`]. The runtime
//! cares only about the contract: a pushed unit is observable by some later
//! pop, a pop never invents units, and the `num_scheds`/`num_blocked`
//! counters are runtime-owned. `num_blocked` is the pool's obligation count:
//! units that suspended out of the pool and are expected back. A pool is
//! *empty* only when its store is drained **and** it has no obligations.

mod fifo;
mod fifo_wait;
mod randws;
mod user;

pub use user::UserPoolDef;

use crate::unit::{AnyUnit, UnitRef};
use crate::{global, Error, Result};
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

/// Declared concurrent-access mode, a hint for schedulers (private pools are
/// drained first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolAccess {
    Priv,
    Spsc,
    Mpsc,
    Spmc,
    Mpmc,
}

impl PoolAccess {
    /// Scheduler drain order: private before single-side before full MPMC.
    pub(crate) fn sort_rank(self) -> u8 {
        match self {
            PoolAccess::Priv => 0,
            PoolAccess::Spsc | PoolAccess::Mpsc => 1,
            PoolAccess::Spmc | PoolAccess::Mpmc => 2,
        }
    }
}

bitflags! {
    /// Why a pool operation is happening; passed through to implementations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolContext: u64 {
        const OWNER_PRIMARY = 1 << 0;
        const OWNER_SECONDARY = 1 << 1;
        const OP_POOL_OTHER = 1 << 2;
        const OP_CREATE = 1 << 3;
        const OP_CREATE_TO = 1 << 4;
        const OP_REVIVE = 1 << 5;
        const OP_YIELD = 1 << 6;
        const OP_RESUME = 1 << 7;
        const OP_MIGRATE = 1 << 8;
    }
}

bitflags! {
    /// Optional operations a pool implementation provides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolCaps: u32 {
        const POP_WAIT = 1 << 0;
        const POP_MANY = 1 << 1;
        const PUSH_MANY = 1 << 2;
        const REMOVE = 1 << 3;
        const SIZE = 1 << 4;
        const PRINT = 1 << 5;
    }
}

/// The capability record every pool provides: required operations plus
/// optional ones with unsupported defaults.
pub(crate) trait PoolImpl: Send + Sync {
    fn push(&self, unit: UnitRef, ctx: PoolContext);
    fn pop(&self, ctx: PoolContext) -> Option<UnitRef>;
    fn is_empty(&self) -> bool;
    fn caps(&self) -> PoolCaps;

    fn pop_wait(&self, _timeout: Duration, _ctx: PoolContext) -> Option<UnitRef> {
        None
    }

    /// Pop up to `max` units. The default keeps popping one at a time.
    fn pop_many(&self, max: usize, ctx: PoolContext) -> Vec<UnitRef> {
        let mut units = Vec::new();
        while units.len() < max {
            match self.pop(ctx) {
                Some(unit) => units.push(unit),
                None => break,
            }
        }
        units
    }

    /// Push a batch of units. The default pushes one at a time.
    fn push_many(&self, units: Vec<UnitRef>, ctx: PoolContext) {
        for unit in units {
            self.push(unit, ctx);
        }
    }

    fn remove(&self, _unit: &UnitRef) -> Result<()> {
        Err(Error::FeatureNa)
    }

    fn size(&self) -> Option<usize> {
        None
    }

    fn for_each(&self, _f: &mut dyn FnMut(&UnitRef)) -> Result<()> {
        Err(Error::FeatureNa)
    }

    /// Teardown hook, called once when the pool descriptor is released.
    fn on_free(&self) {}
}

static POOL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct PoolInner {
    id: u64,
    access: PoolAccess,
    automatic: bool,
    /// Number of schedulers draining this pool.
    num_scheds: AtomicI32,
    /// Number of blocked units expected to return (the obligation count).
    num_blocked: AtomicI32,
    imp: Box<dyn PoolImpl>,
}

impl PoolInner {
    pub(crate) fn push_unit(&self, unit: UnitRef, ctx: PoolContext) {
        unit.is_in_pool.store(true, Ordering::Release);
        self.imp.push(unit, ctx);
    }

    pub(crate) fn pop_unit(&self, ctx: PoolContext) -> Option<UnitRef> {
        let unit = self.imp.pop(ctx)?;
        unit.is_in_pool.store(false, Ordering::Relaxed);
        Some(unit)
    }

    pub(crate) fn pop_wait_unit(&self, timeout: Duration, ctx: PoolContext) -> Option<UnitRef> {
        let unit = self.imp.pop_wait(timeout, ctx)?;
        unit.is_in_pool.store(false, Ordering::Relaxed);
        Some(unit)
    }

    pub(crate) fn remove_unit(&self, unit: &UnitRef) -> Result<()> {
        self.imp.remove(unit)?;
        unit.is_in_pool.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn inc_blocked(&self) {
        self.num_blocked.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_blocked(&self) {
        let prev = self.num_blocked.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    /// Whether the pool still owes work: store non-empty or obligations
    /// outstanding.
    pub(crate) fn has_units(&self) -> bool {
        !self.imp.is_empty() || self.num_blocked.load(Ordering::Acquire) > 0
    }

    pub(crate) fn retain(&self) {
        self.num_scheds.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_sched(&self) {
        let prev = self.num_scheds.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub(crate) fn caps(&self) -> PoolCaps {
        self.imp.caps()
    }

    pub(crate) fn automatic(&self) -> bool {
        self.automatic
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.imp.on_free();
    }
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("access", &self.access)
            .field("num_scheds", &self.num_scheds.load(Ordering::Relaxed))
            .field("num_blocked", &self.num_blocked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A handle to a pool of ready work units.
#[derive(Clone, Debug)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Pool {}

impl Pool {
    pub(crate) fn from_impl(imp: Box<dyn PoolImpl>, access: PoolAccess, automatic: bool) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                id: POOL_ID.fetch_add(1, Ordering::Relaxed),
                access,
                automatic,
                num_scheds: AtomicI32::new(0),
                num_blocked: AtomicI32::new(0),
                imp,
            }),
        }
    }

    /// Built-in unbounded FIFO.
    pub fn fifo(access: PoolAccess, automatic: bool) -> Result<Pool> {
        global::ensure_init()?;
        Ok(Self::fifo_internal(access, automatic))
    }

    pub(crate) fn fifo_internal(access: PoolAccess, automatic: bool) -> Pool {
        Self::from_impl(Box::new(fifo::FifoPool::new()), access, automatic)
    }

    /// Built-in FIFO whose `pop_wait` parks the caller until work arrives.
    pub fn fifo_wait(access: PoolAccess, automatic: bool) -> Result<Pool> {
        global::ensure_init()?;
        Ok(Self::fifo_wait_internal(access, automatic))
    }

    pub(crate) fn fifo_wait_internal(access: PoolAccess, automatic: bool) -> Pool {
        Self::from_impl(Box::new(fifo_wait::FifoWaitPool::new()), access, automatic)
    }

    /// Built-in random work-stealing pool: per-stream local queues with a
    /// shared overflow queue.
    pub fn randws(access: PoolAccess, automatic: bool) -> Result<Pool> {
        global::ensure_init()?;
        Ok(Self::from_impl(
            Box::new(randws::RandWsPool::new(global::config().max_xstreams)),
            access,
            automatic,
        ))
    }

    /// A pool backed by user-supplied operations. See [`UserPoolDef`].
    pub fn custom(
        def: Box<dyn UserPoolDef>,
        access: PoolAccess,
        automatic: bool,
    ) -> Result<Pool> {
        global::ensure_init()?;
        def.init()?;
        Ok(Self::from_impl(
            Box::new(user::UserPool::new(def)),
            access,
            automatic,
        ))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn access(&self) -> PoolAccess {
        self.inner.access
    }

    #[must_use]
    pub fn caps(&self) -> PoolCaps {
        self.inner.caps()
    }

    /// Whether the pool has neither queued units nor outstanding obligations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.inner.has_units()
    }

    /// Number of queued units, if the implementation can count.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        self.inner.imp.size()
    }

    /// Queued units plus outstanding obligations.
    #[must_use]
    pub fn total_size(&self) -> usize {
        let queued = self
            .inner
            .imp
            .size()
            .unwrap_or_else(|| usize::from(!self.inner.imp.is_empty()));
        let blocked = self.inner.num_blocked.load(Ordering::Acquire).max(0);
        queued + usize::try_from(blocked).unwrap_or(0)
    }

    pub fn push(&self, unit: &AnyUnit) -> Result<()> {
        global::ensure_init()?;
        self.inner
            .push_unit(unit.r.clone(), PoolContext::OP_POOL_OTHER);
        Ok(())
    }

    pub fn pop(&self) -> Result<Option<AnyUnit>> {
        global::ensure_init()?;
        Ok(self
            .inner
            .pop_unit(PoolContext::OP_POOL_OTHER)
            .map(AnyUnit::from_ref))
    }

    /// Pop, parking the caller for up to `timeout` if the pool is empty.
    pub fn pop_wait(&self, timeout: Duration) -> Result<Option<AnyUnit>> {
        global::ensure_init()?;
        if !self.caps().contains(PoolCaps::POP_WAIT) {
            return Err(Error::FeatureNa);
        }
        Ok(self
            .inner
            .pop_wait_unit(timeout, PoolContext::OP_POOL_OTHER)
            .map(AnyUnit::from_ref))
    }

    /// Pop, parking the caller until an absolute deadline.
    pub fn pop_timedwait(&self, deadline: Instant) -> Result<Option<AnyUnit>> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.pop_wait(timeout)
    }

    /// Pop up to `max` units in one call.
    pub fn pop_many(&self, max: usize) -> Result<Vec<AnyUnit>> {
        global::ensure_init()?;
        let units = self.inner.imp.pop_many(max, PoolContext::OP_POOL_OTHER);
        Ok(units
            .into_iter()
            .map(|unit| {
                unit.is_in_pool.store(false, core::sync::atomic::Ordering::Relaxed);
                AnyUnit::from_ref(unit)
            })
            .collect())
    }

    /// Push a batch of units in one call.
    pub fn push_many(&self, units: &[AnyUnit]) -> Result<()> {
        global::ensure_init()?;
        let units = units
            .iter()
            .map(|unit| {
                unit.r
                    .is_in_pool
                    .store(true, core::sync::atomic::Ordering::Release);
                unit.r.clone()
            })
            .collect();
        self.inner.imp.push_many(units, PoolContext::OP_POOL_OTHER);
        Ok(())
    }

    /// Remove a specific queued unit (required for `yield_to`).
    pub fn remove(&self, unit: &AnyUnit) -> Result<()> {
        global::ensure_init()?;
        self.inner.remove_unit(&unit.r)
    }

    /// Visit every queued unit.
    pub fn print_all(&self, mut f: impl FnMut(&AnyUnit)) -> Result<()> {
        global::ensure_init()?;
        self.inner.imp.for_each(&mut |unit| {
            let handle = AnyUnit::from_ref(unit.clone());
            f(&handle);
        })
    }
}
