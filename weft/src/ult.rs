// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The context-transfer fabric.
//!
//! Every transfer follows the same shape: the outgoing unit records a
//! *deferred action* on its execution stream, switches (or jumps), and the
//! first code to run in the incoming context executes that action. Anything
//! that must not happen until the outgoing context is fully saved (pushing
//! the yielder back to its pool, releasing a wait-list guard lock, publishing
//! a joiner on the join link) goes through this mechanism; doing it before
//! the switch would let another stream resume (or terminate into) a context
//! that is still live.
//!
//! The deferred action runs at exactly three kinds of resume points: after
//! the switch in [`schedule`] (the dispatcher), after the switch in the
//! yield/suspend family, and at the top of [`ult_entry`] (a fresh context's
//! first run).

use crate::pool::{Pool, PoolContext};
use crate::spin::RawSpinlock;
use crate::unit::{
    decode_link, LinkTarget, Request, Unit, UnitKind, UnitRef, UnitState, LINK_TERMINATED,
};
use crate::xstream::XstreamInner;
use crate::{local, tool, Error, Result};
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;
use weft_context::Context;

/// Work that must run in the next context, after the current one is saved.
pub(crate) enum Deferred {
    /// Make the unit READY and push it to its pool; optionally drop an
    /// obligation count afterwards (the yield-to transfer window).
    PushReady {
        unit: UnitRef,
        dec_blocked: Option<Pool>,
    },
    /// Release a guard lock (wait-list wait).
    Unlock(*const RawSpinlock),
    /// Publish `joiner` on `target`'s join link; if the target already
    /// terminated, resume the joiner instead.
    JoinPublish { target: UnitRef, joiner: UnitRef },
    /// Stage `new` as the replacement of the main scheduler `old`, with the
    /// suspended `waiter` to resume once the swap completes.
    ReplaceSched {
        new: crate::sched::Sched,
        old: crate::sched::Sched,
        waiter: UnitRef,
    },
    /// Drop a reference that must outlive the switch (join handoff).
    DropRef(UnitRef),
}

// Safety: the raw pointer variant refers to a lock owned by a wait-list (or
// synchronization object) that outlives the blocked unit; deferred actions
// only ever move between contexts of one execution stream.
unsafe impl Send for Deferred {}

/// Run the pending deferred action of the calling stream, if any. Must be the
/// first runtime work after every switch and at fresh-context entry.
pub(crate) fn run_deferred_current() {
    let Some(es) = local::current() else { return };
    let Some(action) = es.take_deferred() else {
        return;
    };
    match action {
        Deferred::PushReady { unit, dec_blocked } => {
            push_ready(unit, PoolContext::OP_YIELD);
            if let Some(pool) = dec_blocked {
                pool.inner.dec_blocked();
            }
        }
        // Safety: the lock outlives the blocked unit that deferred this, and
        // it was acquired by that unit before switching away.
        Deferred::Unlock(lock) => unsafe { (*lock).release() },
        Deferred::JoinPublish { target, joiner } => {
            let encoded = joiner.as_ptr().as_ptr() as usize;
            match target.link.compare_exchange(
                crate::unit::LINK_NONE,
                encoded,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // The link owns the joiner reference now; the terminator
                // reconstitutes it.
                Ok(_) => core::mem::forget(joiner),
                // The target terminated before we could publish; wake the
                // joiner right back up. It will observe the state itself.
                Err(_) => resume_and_push(joiner),
            }
        }
        Deferred::ReplaceSched { new, old, waiter } => {
            new.request_replace(&old, waiter);
        }
        Deferred::DropRef(unit) => drop(unit),
    }
}

/// Entry point of every fresh ULT context.
pub(crate) unsafe extern "C" fn ult_entry(arg: *mut ()) -> ! {
    let unit = NonNull::new(arg.cast::<Unit>()).expect("ULT entry without a descriptor");
    run_deferred_current();
    handle_resumed_requests(unit);

    // Safety: `body` is only touched on dispatch edges of the unit itself.
    let body = unsafe { (*unit.as_ref().body.get()).take() };
    if let Some(body) = body {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        if result.is_err() {
            // Safety: the descriptor outlives the running unit.
            let id = unsafe { unit.as_ref() }.id();
            tracing::error!(id, "work unit body panicked");
        }
    }
    exit_current(unit)
}

/// Consult the request word after a transfer, before returning to user code.
pub(crate) fn handle_resumed_requests(unit: NonNull<Unit>) {
    // Safety: the unit is the caller's own descriptor.
    let u = unsafe { unit.as_ref() };
    if u.requests().contains(Request::CANCEL) {
        tool::emit(tool::ToolEventKind::Cancel, u);
        exit_current(unit);
    }
}

fn after_switch(unit: NonNull<Unit>) {
    run_deferred_current();
    handle_resumed_requests(unit);
}

/// Make `unit` READY and push it to its associated pool, honoring a pending
/// migration request at this edge.
pub(crate) fn push_ready(unit: UnitRef, ctx: PoolContext) {
    if unit.requests().contains(Request::MIGRATE) {
        complete_migration(&unit);
    }
    let pool = unit.pool_clone().expect("work unit has no associated pool");
    // Relaxed: the pool push below publishes the state.
    unit.state.store(UnitState::Ready as u8, Ordering::Relaxed);
    pool.inner.push_unit(unit, ctx);
}

/// Re-associate a unit with its migration target and invoke the user
/// callback exactly once. The request bit is cleared last.
fn complete_migration(unit: &UnitRef) {
    let target = unit.mig_data().target.lock().take();
    if let Some(target) = target {
        let already_there = unit.pool_clone().is_some_and(|p| p == target);
        if !already_there {
            *unit.pool.lock() = Some(target);
            let callback = unit.mig_data().callback.lock().take();
            if let Some(callback) = callback {
                callback(&crate::unit::Ult { r: unit.clone() });
                let mut slot = unit.mig_data().callback.lock();
                if slot.is_none() {
                    *slot = Some(callback);
                }
            }
            tracing::debug!(id = unit.id(), "migration completed");
        }
    }
    unit.request
        .fetch_and(!Request::MIGRATE.bits(), Ordering::Release);
}

// === dispatch ==============================================================

/// Dispatch one popped unit on the calling stream: a direct context switch
/// for ULTs, an inline run for tasklets. Control returns here when the unit
/// yields, suspends or exits.
pub(crate) fn schedule(unit: UnitRef) {
    let es = local::current().expect("dispatch outside an execution stream");

    let req = unit.requests();
    if req.contains(Request::CANCEL) {
        // Terminate without running the body (or without resuming, for a
        // previously started unit). Joiners are woken.
        tool::emit(tool::ToolEventKind::Cancel, &unit);
        terminate_detached(&unit);
        tool::emit(tool::ToolEventKind::Free, &unit);
        return;
    }
    if req.contains(Request::MIGRATE) {
        // Honor the migration at this edge and re-queue on the target pool.
        push_ready(unit, PoolContext::OP_MIGRATE);
        return;
    }

    let parent = es
        .current_unit()
        .expect("dispatch without a current parent unit");
    unit.parent.store(parent.as_ptr(), Ordering::Relaxed);
    unit.last_stream
        .store(es.as_mut_ptr(), Ordering::Relaxed);

    if unit.is_yieldable() {
        unit.state.store(UnitState::Running as u8, Ordering::Relaxed);
        es.set_current(unit.as_ptr());
        tool::emit(tool::ToolEventKind::Run, &unit);
        // Safety: `parent` is the context this code runs on; `unit` holds a
        // suspended (or fresh) context published to this stream by the pool
        // pop.
        unsafe {
            let parent_ctx: *const Context = &parent.as_ref().yctx().mctx;
            Context::switch(&*parent_ctx, &unit.yctx().mctx);
        }
        // The dispatched unit yielded, suspended or exited.
        run_deferred_current();
        let es = local::current().expect("dispatcher resumed off-stream");
        es.set_current(parent);
        if unit.state() == UnitState::Terminated {
            tool::emit(tool::ToolEventKind::Free, &unit);
        }
    } else {
        // Tasklets run to completion right here, on the dispatcher's stack.
        unit.state.store(UnitState::Running as u8, Ordering::Relaxed);
        es.set_current(unit.as_ptr());
        tool::emit(tool::ToolEventKind::Run, &unit);
        // Safety: `body` is only touched on dispatch edges of the unit.
        let body = unsafe { (*unit.body.get()).take() };
        if let Some(body) = body {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
            if result.is_err() {
                tracing::error!(id = unit.id(), "tasklet body panicked");
            }
        }
        tool::emit(tool::ToolEventKind::Finish, &unit);
        terminate_detached(&unit);
        es.set_current(parent);
    }
    // Dropping the dispatch reference releases unnamed terminated units.
}

/// Terminate a unit from outside its own context (cancel-at-dispatch,
/// tasklet completion): store the final state and wake any joiner, without a
/// direct handoff.
fn terminate_detached(unit: &UnitRef) {
    unit.state
        .store(UnitState::Terminated as u8, Ordering::Release);
    match decode_link(unit.link.swap(LINK_TERMINATED, Ordering::AcqRel)) {
        // Safety: the cell lives on the (still parked) joiner's stack.
        LinkTarget::Ext(cell) => unsafe { (*cell).resume() },
        LinkTarget::Joiner(joiner) => {
            // Safety: the link held a counted reference.
            let joiner = unsafe { UnitRef::from_raw(joiner) };
            resume_and_push(joiner);
        }
        LinkTarget::None | LinkTarget::Terminated => {}
    }
}

// === the yield/suspend/exit family =========================================

fn parent_of(unit: NonNull<Unit>) -> Option<NonNull<Unit>> {
    // Safety: the unit is live.
    NonNull::new(unsafe { unit.as_ref() }.parent.load(Ordering::Relaxed))
}

/// Yield the calling unit to its parent, pushing it back to its pool.
/// A no-op from non-yieldable contexts.
pub(crate) fn yield_now() -> Result<()> {
    let Some(es) = local::current() else {
        return Ok(());
    };
    let Some(cur) = es.current_unit() else {
        return Ok(());
    };
    // Safety: `cur` is the caller's own descriptor.
    if !unsafe { cur.as_ref() }.is_yieldable() {
        return Ok(());
    }
    yield_now_internal(cur);
    Ok(())
}

/// Yield a known-yieldable current unit.
pub(crate) fn yield_now_internal(cur: NonNull<Unit>) {
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    let Some(parent) = parent_of(cur) else {
        // The root unit has no parent to yield to.
        return;
    };
    tool::emit(tool::ToolEventKind::Yield, u);
    let es = local::current().expect("yield outside an execution stream");
    // Safety: `cur` is live.
    es.set_deferred(Deferred::PushReady {
        unit: unsafe { UnitRef::clone_raw(cur) },
        dec_blocked: None,
    });
    // Safety: the parent context is suspended in its dispatch frame on this
    // stream.
    unsafe {
        let parent_ctx: *const Context = &parent.as_ref().yctx().mctx;
        Context::switch(&u.yctx().mctx, &*parent_ctx);
    }
    after_switch(cur);
}

/// Block the calling ULT. It is *not* pushed anywhere; a waker must later
/// call [`resume_and_push`] (directly or through a wait-list signal).
pub(crate) fn suspend() -> Result<()> {
    suspend_with_action(None)
}

/// As [`suspend`], but release `lock` once the calling context is saved.
/// This is the wait-list integration point: the caller enqueues itself under
/// `lock`, and the lock must stay held until the context can actually be
/// resumed.
pub(crate) fn suspend_with(lock: *const RawSpinlock) -> Result<()> {
    suspend_with_action(Some(Deferred::Unlock(lock)))
}

/// As [`suspend`], with an arbitrary action deferred until the calling
/// context is saved.
pub(crate) fn suspend_with_action(action: Option<Deferred>) -> Result<()> {
    let (es, cur) = yieldable_current()?;
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    let parent = parent_of(cur).ok_or(Error::InvalidContext)?;
    tool::emit(tool::ToolEventKind::Suspend, u);
    u.state
        .store(UnitState::Blocked as u8, Ordering::Relaxed);
    if let Some(pool) = u.pool_clone() {
        pool.inner.inc_blocked();
    }
    if let Some(action) = action {
        es.set_deferred(action);
    }
    // Safety: as in `yield_now_internal`.
    unsafe {
        let parent_ctx: *const Context = &parent.as_ref().yctx().mctx;
        Context::switch(&u.yctx().mctx, &*parent_ctx);
    }
    after_switch(cur);
    Ok(())
}

/// Suspend the calling ULT as a joiner of `target`: the join-link publication
/// happens after the context is saved, and loses gracefully if the target
/// terminates first.
pub(crate) fn suspend_join(target: &UnitRef) {
    let Ok((es, cur)) = yieldable_current() else {
        unreachable!("suspend_join from a non-yieldable context");
    };
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    let parent = parent_of(cur).expect("joiner has no parent");
    tool::emit(tool::ToolEventKind::Suspend, u);
    u.state
        .store(UnitState::Blocked as u8, Ordering::Relaxed);
    if let Some(pool) = u.pool_clone() {
        pool.inner.inc_blocked();
    }
    es.set_deferred(Deferred::JoinPublish {
        target: target.clone(),
        // Safety: `cur` is live.
        joiner: unsafe { UnitRef::clone_raw(cur) },
    });
    // Safety: as in `yield_now_internal`.
    unsafe {
        let parent_ctx: *const Context = &parent.as_ref().yctx().mctx;
        Context::switch(&u.yctx().mctx, &*parent_ctx);
    }
    after_switch(cur);
}

/// Suspend the calling ULT as an orphan: no pool obligation is recorded and
/// nothing will push it back. Used by finalize, where the primary ULT parks
/// itself until the root loop jumps back into it.
pub(crate) fn yield_orphan() -> Result<()> {
    let (_es, cur) = yieldable_current()?;
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    let parent = parent_of(cur).ok_or(Error::InvalidContext)?;
    tool::emit(tool::ToolEventKind::Suspend, u);
    u.state
        .store(UnitState::Blocked as u8, Ordering::Relaxed);
    // Safety: as in `yield_now_internal`.
    unsafe {
        let parent_ctx: *const Context = &parent.as_ref().yctx().mctx;
        Context::switch(&u.yctx().mctx, &*parent_ctx);
    }
    run_deferred_current();
    Ok(())
}

/// Wake a BLOCKED unit: drop its obligation count and push it READY.
pub(crate) fn resume_and_push(unit: UnitRef) {
    debug_assert_eq!(unit.state(), UnitState::Blocked);
    tool::emit(tool::ToolEventKind::Resume, &unit);
    if let Some(pool) = unit.pool_clone() {
        pool.inner.dec_blocked();
    }
    push_ready(unit, PoolContext::OP_RESUME);
}

/// Terminate the calling unit. Joiners are handed off to directly when they
/// last ran on this stream; otherwise they are pushed (or their park cell is
/// signalled). Never returns.
pub(crate) fn exit_current(unit: NonNull<Unit>) -> ! {
    let es = local::current().expect("exit outside an execution stream");
    // Safety: `unit` is the caller's own descriptor and outlives this call:
    // the dispatch frame still holds a reference.
    let u = unsafe { unit.as_ref() };
    tool::emit(tool::ToolEventKind::Finish, u);
    u.state
        .store(UnitState::Terminated as u8, Ordering::Release);

    match decode_link(u.link.swap(LINK_TERMINATED, Ordering::AcqRel)) {
        LinkTarget::Joiner(joiner_ptr) => {
            // Safety: the link held a counted reference.
            let joiner = unsafe { UnitRef::from_raw(joiner_ptr) };
            let same_stream = joiner.last_stream.load(Ordering::Relaxed) == es.as_mut_ptr();
            if same_stream && joiner.is_yieldable() {
                // Single-waiter handoff: jump straight into the joiner. It
                // inherits our dispatcher, so its next yield resumes the
                // frame that dispatched us (which then reaps this unit).
                if let Some(pool) = joiner.pool_clone() {
                    pool.inner.dec_blocked();
                }
                tool::emit(tool::ToolEventKind::Resume, &joiner);
                joiner
                    .parent
                    .store(u.parent.load(Ordering::Relaxed), Ordering::Relaxed);
                joiner
                    .state
                    .store(UnitState::Running as u8, Ordering::Relaxed);
                es.set_current(joiner.as_ptr());
                let joiner_ctx: *const Context = &joiner.yctx().mctx;
                es.set_deferred(Deferred::DropRef(joiner));
                // Safety: the joiner suspended via `suspend_join` and its
                // context is fully saved (the publication we decoded happens
                // after the save).
                unsafe { Context::jump(&*joiner_ctx) }
            }
            resume_and_push(joiner);
        }
        // Safety: the cell lives on the (still parked) joiner's stack.
        LinkTarget::Ext(cell) => unsafe { (*cell).resume() },
        LinkTarget::None | LinkTarget::Terminated => {}
    }

    let parent = parent_of(unit).expect("terminating unit has no parent");
    // Safety: the parent context is suspended in its dispatch frame on this
    // stream; our own context is abandoned.
    unsafe {
        let parent_ctx: *const Context = &parent.as_ref().yctx().mctx;
        Context::jump(&*parent_ctx)
    }
}

// === targeted transfers ====================================================

fn yieldable_current() -> Result<(&'static XstreamInner, NonNull<Unit>)> {
    let es = local::current().ok_or(Error::InvalidContext)?;
    let cur = es.current_unit().ok_or(Error::InvalidContext)?;
    // Safety: `cur` is the caller's own descriptor.
    if !unsafe { cur.as_ref() }.is_yieldable() {
        return Err(Error::InvalidContext);
    }
    Ok((es, cur))
}

/// Yield directly to a READY peer that is sitting in a pool supporting
/// removal. A design-level no-op when the target is not actually ready.
pub(crate) fn yield_to(target: &UnitRef) -> Result<()> {
    let Some(es) = local::current() else {
        return Ok(());
    };
    let Some(cur) = es.current_unit() else {
        return Ok(());
    };
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    if !u.is_yieldable() {
        return Ok(());
    }
    if cur == target.as_ptr() || !target.is_yieldable() {
        return Err(Error::InvalidArg);
    }
    if u.kind().contains(UnitKind::MAIN_SCHED) {
        return Err(Error::InvalidArg);
    }
    let target_pool = target.pool_clone().ok_or(Error::InvalidHandle)?;
    if !target_pool.caps().contains(crate::pool::PoolCaps::REMOVE) {
        return Err(Error::FeatureNa);
    }

    // A unit is "ready" only if it is both in a pool and READY; it is made
    // READY before it is pushed, so check in the reverse order.
    if !(target.is_in_pool.load(Ordering::Acquire) && target.state() == UnitState::Ready) {
        return Ok(());
    }

    let cur_pool = u.pool_clone().ok_or(Error::InvalidHandle)?;
    // Keep an obligation on our own pool while the target is out of its pool
    // and we are not yet pushed, so no scheduler can observe a spuriously
    // drained system.
    cur_pool.inner.inc_blocked();
    if let Err(err) = target_pool.inner.remove_unit(target) {
        cur_pool.inner.dec_blocked();
        return Err(err);
    }

    tool::emit(tool::ToolEventKind::Yield, u);
    switch_into(es, cur, target, Some(cur_pool));
    Ok(())
}

/// Transfer to a freshly created (or revived) unit that was never pushed.
pub(crate) fn transfer_to_fresh(target: &UnitRef) -> Result<()> {
    let (es, cur) = yieldable_current()?;
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    tool::emit(tool::ToolEventKind::Yield, u);
    switch_into(es, cur, target, None);
    Ok(())
}

/// Suspend the calling ULT and transfer to `target` (fresh, or removed from
/// its pool by the caller).
pub(crate) fn suspend_to(target: &UnitRef) -> Result<()> {
    let (es, cur) = yieldable_current()?;
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    tool::emit(tool::ToolEventKind::Suspend, u);
    u.state
        .store(UnitState::Blocked as u8, Ordering::Relaxed);
    if let Some(pool) = u.pool_clone() {
        pool.inner.inc_blocked();
    }
    prepare_target(es, cur, target);
    // Safety: as in `switch_into`.
    unsafe {
        let target_ctx: *const Context = &target.yctx().mctx;
        Context::switch(&u.yctx().mctx, &*target_ctx);
    }
    after_switch(cur);
    Ok(())
}

/// Resume a BLOCKED `target` by direct transfer while suspending the caller.
pub(crate) fn resume_suspend_to(target: &UnitRef) -> Result<()> {
    // Validate the calling context before touching any counters.
    yieldable_current()?;
    if target.state() != UnitState::Blocked {
        return Err(Error::InvalidState);
    }
    if let Some(pool) = target.pool_clone() {
        pool.inner.dec_blocked();
    }
    tool::emit(tool::ToolEventKind::Resume, target);
    suspend_to(target)
}

/// Terminate the calling ULT and transfer to `target` (fresh, or READY in a
/// removable pool). Never returns on success.
pub(crate) fn exit_to(target: &UnitRef) -> Result<()> {
    let (es, cur) = yieldable_current()?;
    if cur == target.as_ptr() || !target.is_yieldable() {
        return Err(Error::InvalidArg);
    }
    if target.is_in_pool.load(Ordering::Acquire) {
        let pool = target.pool_clone().ok_or(Error::InvalidHandle)?;
        pool.inner.remove_unit(target)?;
    }
    // Safety: `cur` is the caller's own descriptor.
    let u = unsafe { cur.as_ref() };
    tool::emit(tool::ToolEventKind::Finish, u);
    u.state
        .store(UnitState::Terminated as u8, Ordering::Release);
    match decode_link(u.link.swap(LINK_TERMINATED, Ordering::AcqRel)) {
        LinkTarget::Joiner(joiner_ptr) => {
            // Safety: the link held a counted reference.
            let joiner = unsafe { UnitRef::from_raw(joiner_ptr) };
            resume_and_push(joiner);
        }
        // Safety: the cell lives on the (still parked) joiner's stack.
        LinkTarget::Ext(cell) => unsafe { (*cell).resume() },
        LinkTarget::None | LinkTarget::Terminated => {}
    }
    prepare_target(es, cur, target);
    let target_ctx: *const Context = &target.yctx().mctx;
    // Safety: the target is suspended; our own context is abandoned.
    unsafe { Context::jump(&*target_ctx) }
}

fn prepare_target(es: &XstreamInner, cur: NonNull<Unit>, target: &UnitRef) {
    // Safety: `cur` is live.
    let u = unsafe { cur.as_ref() };
    target
        .last_stream
        .store(es.as_mut_ptr(), Ordering::Relaxed);
    // The target inherits our dispatcher: its next yield-to-parent resumes
    // the frame that dispatched us.
    target
        .parent
        .store(u.parent.load(Ordering::Relaxed), Ordering::Relaxed);
    target
        .state
        .store(UnitState::Running as u8, Ordering::Relaxed);
    es.set_current(target.as_ptr());
}

fn switch_into(
    es: &XstreamInner,
    cur: NonNull<Unit>,
    target: &UnitRef,
    dec_blocked: Option<Pool>,
) {
    // Safety: `cur` is live.
    let u = unsafe { cur.as_ref() };
    prepare_target(es, cur, target);
    tool::emit(tool::ToolEventKind::Run, target);
    es.set_deferred(Deferred::PushReady {
        // Safety: `cur` is live.
        unit: unsafe { UnitRef::clone_raw(cur) },
        dec_blocked,
    });
    // Safety: the target context is fresh or was removed from its pool by
    // the caller; our own context is saved into `u`.
    unsafe {
        let target_ctx: *const Context = &target.yctx().mctx;
        Context::switch(&u.yctx().mctx, &*target_ctx);
    }
    after_switch(cur);
}
