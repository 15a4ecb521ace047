// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fast paths operating on the calling work unit.

use crate::pool::Pool;
use crate::sched::Sched;
use crate::unit::{AnyUnit, Tasklet, Ult, UnitKind, UnitRef};
use crate::xstream::{Xstream, XstreamInner};
use crate::{global, local, ult, Error, Result};
use core::convert::Infallible;

fn current_ref() -> Option<UnitRef> {
    let cur = local::current()?.current_unit()?;
    // Safety: the current unit is live while this code runs on it.
    Some(unsafe { UnitRef::clone_raw(cur) })
}

/// Yield the calling ULT back to its dispatcher, re-queueing it in its pool.
/// A no-op from non-yieldable contexts.
pub fn yield_now() -> Result<()> {
    global::ensure_init()?;
    ult::yield_now()
}

/// Yield the calling ULT directly to `target`, which must be READY in a pool
/// that supports removal. If it is not ready the call is a no-op.
pub fn yield_to(target: &Ult) -> Result<()> {
    global::ensure_init()?;
    ult::yield_to(&target.r)
}

/// Block the calling ULT until someone calls [`Ult::resume`] on it (or a
/// wait-list signal reaches it).
pub fn suspend() -> Result<()> {
    global::ensure_init()?;
    ult::suspend()
}

/// Suspend the calling ULT and transfer directly to `target`.
pub fn suspend_to(target: &Ult) -> Result<()> {
    global::ensure_init()?;
    detach_target(&target.r)?;
    ult::suspend_to(&target.r)
}

/// Resume the BLOCKED `target` by direct transfer, suspending the caller.
pub fn resume_suspend_to(target: &Ult) -> Result<()> {
    global::ensure_init()?;
    ult::resume_suspend_to(&target.r)
}

/// Terminate the calling ULT. Never returns on success.
pub fn exit() -> Result<Infallible> {
    global::ensure_init()?;
    let es = local::current().ok_or(Error::InvalidContext)?;
    let cur = es.current_unit().ok_or(Error::InvalidContext)?;
    // Safety: the current unit is live.
    let u = unsafe { cur.as_ref() };
    if !u.is_yieldable() {
        return Err(Error::InvalidContext);
    }
    if u.kind()
        .intersects(UnitKind::PRIMARY | UnitKind::ROOT | UnitKind::MAIN_SCHED)
    {
        return Err(Error::InvalidArg);
    }
    ult::exit_current(cur)
}

/// Terminate the calling ULT and transfer directly to `target`. Never
/// returns on success.
pub fn exit_to(target: &Ult) -> Result<Infallible> {
    global::ensure_init()?;
    ult::exit_to(&target.r)?;
    unreachable!("exit_to returned after a completed transfer")
}

/// Dispatch a popped unit on the calling stream. This is what scheduler `run`
/// loops call for each unit they pop.
pub fn run_unit(unit: AnyUnit) -> Result<()> {
    global::ensure_init()?;
    if local::current().is_none() {
        return Err(Error::InvalidContext);
    }
    ult::schedule(unit.r);
    Ok(())
}

/// Process scheduler events (main-scheduler replacement among them). Run
/// loops call this every `event_freq` pops.
pub fn check_events(sched: &Sched) -> Result<()> {
    global::ensure_init()?;
    if local::current().is_none() {
        return Err(Error::InvalidContext);
    }
    crate::sched::check_events(sched);
    Ok(())
}

/// The calling work unit, if the caller runs inside the runtime.
#[must_use]
pub fn unit() -> Option<AnyUnit> {
    current_ref().map(AnyUnit::from_ref)
}

/// The calling ULT, if the caller is one.
#[must_use]
pub fn ult() -> Option<Ult> {
    let r = current_ref()?;
    r.is_yieldable().then_some(Ult { r })
}

/// The calling tasklet, if the caller is one.
#[must_use]
pub fn tasklet() -> Option<Tasklet> {
    let r = current_ref()?;
    (!r.is_yieldable()).then_some(Tasklet { r })
}

/// The stream the caller runs on.
#[must_use]
pub fn xstream() -> Option<Xstream> {
    Xstream::self_()
}

/// Rank of the stream the caller runs on.
#[must_use]
pub fn xstream_rank() -> Option<i32> {
    local::current().map(XstreamInner::rank)
}

/// The calling unit's associated pool.
#[must_use]
pub fn last_pool() -> Option<Pool> {
    current_ref()?.pool_clone()
}

/// Whether the caller is the primary ULT.
#[must_use]
pub fn is_primary() -> bool {
    current_ref().is_some_and(|r| r.kind().contains(UnitKind::PRIMARY))
}

/// Whether the caller runs on a ULT (as opposed to a tasklet or an external
/// thread).
#[must_use]
pub fn on_ult() -> bool {
    current_ref().is_some_and(|r| r.is_yieldable())
}

/// Id of the calling unit.
#[must_use]
pub fn unit_id() -> Option<u64> {
    current_ref().map(|r| r.id())
}

/// Remove `target` from its pool if it is queued there, so a direct transfer
/// can take it.
fn detach_target(target: &UnitRef) -> Result<()> {
    if target.is_in_pool.load(core::sync::atomic::Ordering::Acquire) {
        let pool = target.pool_clone().ok_or(Error::InvalidHandle)?;
        pool.inner.remove_unit(target)?;
    }
    Ok(())
}
