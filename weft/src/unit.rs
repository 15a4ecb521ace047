// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Work-unit descriptors.
//!
//! A work unit is either a yieldable user-level thread (ULT) owning a private
//! stack and machine context, or a non-yieldable tasklet that runs to
//! completion on its dispatcher's stack. Descriptors are manually reference
//! counted: user handles ([`Ult`], [`Tasklet`], [`AnyUnit`]), pool membership
//! and in-flight dispatch frames each hold a count, and the descriptor is
//! released when it drops to zero. Work-unit-local storage destructors run at
//! release.

use crate::key::Ktable;
use crate::park::ParkCell;
use crate::pool::{Pool, PoolContext};
use crate::sched::Sched;
use crate::spin::Spinlock;
use crate::xstream::{Xstream, XstreamInner};
use crate::{global, local, tool, ult, Error, Result};
use bitflags::bitflags;
use cordyceps::{list, Linked};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};
use weft_context::{Context, HeapStack, Stack, StackGuard};

bitflags! {
    /// Work-unit type bits. An external thread is represented by the empty
    /// set. Exactly one `MEM_*` bit is set on units with a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct UnitKind: u32 {
        const THREAD = 1 << 0;
        const ROOT = 1 << 1;
        const PRIMARY = 1 << 2;
        const MAIN_SCHED = 1 << 3;
        const YIELDABLE = 1 << 4;
        const NAMED = 1 << 5;
        const MIGRATABLE = 1 << 6;
        /// Descriptor only; the unit runs on a stack the runtime does not own.
        const MEM_DESC = 1 << 7;
        /// Descriptor plus a runtime-allocated stack.
        const MEM_DESC_STACK = 1 << 8;
        /// Descriptor plus a caller-provided stack.
        const MEM_USER_STACK = 1 << 9;
    }
}

bitflags! {
    /// Request bits observed at context edges.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Request: u32 {
        const JOIN = 1 << 0;
        const CANCEL = 1 << 1;
        const MIGRATE = 1 << 2;
    }
}

/// Observable work-unit state.
///
/// Transitions follow `READY -> RUNNING -> {BLOCKED -> READY, TERMINATED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Terminated = 3,
}

impl UnitState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => UnitState::Ready,
            1 => UnitState::Running,
            2 => UnitState::Blocked,
            _ => UnitState::Terminated,
        }
    }
}

pub(crate) type Body = Box<dyn FnOnce() + Send + 'static>;

/// Where a yieldable unit's stack came from.
pub(crate) enum StackSource {
    /// The unit wraps an OS thread's own stack (primary and root ULTs).
    OsThread,
    Heap(HeapStack),
    /// Caller-provided memory; not freed by the runtime.
    Raw { top: usize, size: usize },
}

impl StackSource {
    pub(crate) fn top(&self) -> Option<weft_context::StackPointer> {
        match self {
            StackSource::OsThread => None,
            StackSource::Heap(stack) => Some(stack.top()),
            StackSource::Raw { top, .. } => weft_context::StackPointer::new(*top),
        }
    }

    pub(crate) fn size(&self) -> usize {
        match self {
            StackSource::OsThread => 0,
            StackSource::Heap(stack) => stack.size(),
            StackSource::Raw { size, .. } => *size,
        }
    }
}

/// The yieldable extension: a machine context and the stack it runs on.
pub(crate) struct YieldCtx {
    pub(crate) mctx: Context,
    pub(crate) stack: StackSource,
}

/// Join linkage values (`Unit::link`). Zero is "no joiner"; the terminated
/// sentinel and the external tag live in the two low bits, which are free
/// because both descriptors and park cells are at least 8-byte aligned.
pub(crate) const LINK_NONE: usize = 0;
pub(crate) const LINK_TERMINATED: usize = 0b01;
const LINK_EXT_TAG: usize = 0b10;

pub(crate) enum LinkTarget {
    None,
    Terminated,
    Ext(*const ParkCell),
    Joiner(NonNull<Unit>),
}

pub(crate) fn decode_link(raw: usize) -> LinkTarget {
    match raw {
        LINK_NONE => LinkTarget::None,
        LINK_TERMINATED => LinkTarget::Terminated,
        raw if raw & LINK_EXT_TAG != 0 => LinkTarget::Ext((raw & !0b11) as *const ParkCell),
        raw => {
            // Safety: a non-tagged, non-zero value is a joiner descriptor
            // pointer published by `Deferred::JoinPublish` or `join_parked`.
            LinkTarget::Joiner(unsafe { NonNull::new_unchecked(raw as *mut Unit) })
        }
    }
}

pub(crate) fn encode_ext_link(cell: *const ParkCell) -> usize {
    cell as usize | LINK_EXT_TAG
}

/// Migration bookkeeping, allocated on first use.
pub(crate) struct MigData {
    pub(crate) callback: Spinlock<Option<Box<dyn Fn(&Ult) + Send>>>,
    pub(crate) target: Spinlock<Option<Pool>>,
}

static UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// A work-unit descriptor.
pub(crate) struct Unit {
    refs: AtomicUsize,
    /// Intrusive links for pool membership. Guarded by the owning pool's
    /// internal lock; a unit is in at most one pool at a time.
    pub(crate) links: UnsafeCell<list::Links<Unit>>,
    pub(crate) is_in_pool: AtomicBool,
    kind: AtomicU32,
    pub(crate) state: AtomicU8,
    pub(crate) request: AtomicU32,
    id: AtomicU64,
    pub(crate) last_stream: AtomicPtr<XstreamInner>,
    /// The unit that dispatched this one; the target of yield-to-parent.
    /// Written on dispatch edges of the owning stream only.
    pub(crate) parent: AtomicPtr<Unit>,
    /// Associated pool.
    pub(crate) pool: Spinlock<Option<Pool>>,
    /// Token handed out by a user-defined pool, if any.
    pub(crate) token: AtomicU64,
    /// The unit body; taken exactly once when the unit first runs.
    pub(crate) body: UnsafeCell<Option<Body>>,
    mig: AtomicPtr<MigData>,
    pub(crate) keytable: AtomicPtr<Ktable>,
    /// Join linkage (single-waiter handoff), see `decode_link`.
    pub(crate) link: AtomicUsize,
    pub(crate) yctx: Option<YieldCtx>,
}

// Safety: all mutable descriptor state is either atomic, lock-guarded, or
// documented as touched only on its owning stream's dispatch edges (`links`,
// `body`, `parent`, the machine context). The descriptor itself may be shared
// and dropped from any thread.
unsafe impl Send for Unit {}
// Safety: as above.
unsafe impl Sync for Unit {}

impl Unit {
    pub(crate) fn new(
        kind: UnitKind,
        pool: Option<Pool>,
        body: Option<Body>,
        yctx: Option<YieldCtx>,
    ) -> Self {
        Self {
            refs: AtomicUsize::new(1),
            links: UnsafeCell::new(list::Links::new()),
            is_in_pool: AtomicBool::new(false),
            kind: AtomicU32::new(kind.bits()),
            state: AtomicU8::new(UnitState::Ready as u8),
            request: AtomicU32::new(0),
            id: AtomicU64::new(0),
            last_stream: AtomicPtr::new(ptr::null_mut()),
            parent: AtomicPtr::new(ptr::null_mut()),
            pool: Spinlock::new(pool),
            token: AtomicU64::new(0),
            body: UnsafeCell::new(body),
            mig: AtomicPtr::new(ptr::null_mut()),
            keytable: AtomicPtr::new(ptr::null_mut()),
            link: AtomicUsize::new(LINK_NONE),
            yctx,
        }
    }

    pub(crate) fn kind(&self) -> UnitKind {
        UnitKind::from_bits_retain(self.kind.load(Ordering::Relaxed))
    }

    pub(crate) fn add_kind(&self, bits: UnitKind) {
        self.kind.fetch_or(bits.bits(), Ordering::Relaxed);
    }

    pub(crate) fn remove_kind(&self, bits: UnitKind) {
        self.kind.fetch_and(!bits.bits(), Ordering::Relaxed);
    }

    pub(crate) fn is_yieldable(&self) -> bool {
        self.kind().contains(UnitKind::YIELDABLE)
    }

    pub(crate) fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn requests(&self) -> Request {
        Request::from_bits_retain(self.request.load(Ordering::Acquire))
    }

    /// Lazily assigned unit id.
    pub(crate) fn id(&self) -> u64 {
        let id = self.id.load(Ordering::Relaxed);
        if id != 0 {
            return id;
        }
        let fresh = UNIT_ID.fetch_add(1, Ordering::Relaxed);
        match self
            .id
            .compare_exchange(0, fresh, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => fresh,
            Err(raced) => raced,
        }
    }

    pub(crate) fn yctx(&self) -> &YieldCtx {
        self.yctx.as_ref().expect("unit is not yieldable")
    }

    pub(crate) fn pool_clone(&self) -> Option<Pool> {
        self.pool.lock().clone()
    }

    /// Migration bookkeeping, allocated on first use.
    pub(crate) fn mig_data(&self) -> &MigData {
        let existing = self.mig.load(Ordering::Acquire);
        if let Some(mig) = NonNull::new(existing) {
            // Safety: the pointer was published below and lives until the
            // descriptor is dropped.
            return unsafe { &*mig.as_ptr() };
        }
        let fresh = Box::into_raw(Box::new(MigData {
            callback: Spinlock::new(None),
            target: Spinlock::new(None),
        }));
        match self.mig.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // Safety: we just published `fresh`.
            Ok(_) => unsafe { &*fresh },
            Err(raced) => {
                // Safety: `fresh` lost the race and was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // Safety: `raced` is the published pointer.
                unsafe { &*raced }
            }
        }
    }

}

impl Drop for Unit {
    fn drop(&mut self) {
        let ktable = self.keytable.load(Ordering::Acquire);
        if !ktable.is_null() {
            // Safety: the last reference is gone; nobody else can reach the
            // table. Destructors run here, at unit free.
            drop(unsafe { Box::from_raw(ktable) });
        }
        let mig = self.mig.load(Ordering::Acquire);
        if !mig.is_null() {
            // Safety: as above.
            drop(unsafe { Box::from_raw(mig) });
        }
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id.load(Ordering::Relaxed))
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A counted reference to a [`Unit`].
pub(crate) struct UnitRef(NonNull<Unit>);

// Safety: Unit is Send + Sync and the count is atomic.
unsafe impl Send for UnitRef {}
// Safety: as above.
unsafe impl Sync for UnitRef {}

impl UnitRef {
    pub(crate) fn alloc(unit: Unit) -> Self {
        // The descriptor starts with one reference, owned by the returned
        // handle.
        Self(NonNull::from(Box::leak(Box::new(unit))))
    }

    /// Make a new counted reference from a raw descriptor pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live descriptor (one whose count is non-zero).
    pub(crate) unsafe fn clone_raw(ptr: NonNull<Unit>) -> Self {
        // Safety: ensured by caller.
        unsafe { ptr.as_ref() }.refs.fetch_add(1, Ordering::Relaxed);
        Self(ptr)
    }

    /// Adopt a counted reference previously leaked with [`into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must carry exactly one outstanding count from `into_raw` (or an
    /// equivalent leak).
    ///
    /// [`into_raw`]: Self::into_raw
    pub(crate) unsafe fn from_raw(ptr: NonNull<Unit>) -> Self {
        Self(ptr)
    }

    pub(crate) fn into_raw(self) -> NonNull<Unit> {
        let ptr = self.0;
        core::mem::forget(self);
        ptr
    }

    pub(crate) fn as_ptr(&self) -> NonNull<Unit> {
        self.0
    }

    pub(crate) fn ptr_eq(&self, other: &UnitRef) -> bool {
        self.0 == other.0
    }
}

impl Clone for UnitRef {
    fn clone(&self) -> Self {
        // Safety: `self` keeps the descriptor live.
        unsafe { UnitRef::clone_raw(self.0) }
    }
}

impl Drop for UnitRef {
    fn drop(&mut self) {
        // Safety: this reference keeps the descriptor live until the count
        // reaches zero below.
        let unit = unsafe { self.0.as_ref() };
        if unit.refs.fetch_sub(1, Ordering::Release) == 1 {
            core::sync::atomic::fence(Ordering::Acquire);
            tracing::trace!(id = unit.id.load(Ordering::Relaxed), "unit released");
            // Safety: the count is zero; we own the allocation.
            drop(unsafe { Box::from_raw(self.0.as_ptr()) });
        }
    }
}

impl core::ops::Deref for UnitRef {
    type Target = Unit;
    fn deref(&self) -> &Unit {
        // Safety: the reference keeps the descriptor live.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

// Safety: `links` is the intrusive-links field; list membership holds a
// counted reference, and the links are only touched under the owning list's
// lock.
unsafe impl Linked<list::Links<Unit>> for Unit {
    type Handle = UnitRef;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r.into_raw()
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: the list held a counted reference.
        unsafe { UnitRef::from_raw(ptr) }
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: `target` is a live descriptor; `addr_of` avoids creating a
        // reference to the whole struct.
        unsafe {
            let links = ptr::addr_of!((*target.as_ptr()).links);
            NonNull::new_unchecked((*links).get())
        }
    }
}

// === creation ==============================================================

/// Attributes for ULT creation.
#[derive(Debug, Clone)]
pub struct UltAttrs {
    pub(crate) stack_size: Option<usize>,
    pub(crate) guard: StackGuard,
    pub(crate) migratable: bool,
    pub(crate) raw_stack: Option<(usize, usize)>,
}

impl Default for UltAttrs {
    fn default() -> Self {
        Self {
            stack_size: None,
            guard: StackGuard::Page,
            migratable: true,
            raw_stack: None,
        }
    }
}

impl UltAttrs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn guard(mut self, guard: StackGuard) -> Self {
        self.guard = guard;
        self
    }

    #[must_use]
    pub fn migratable(mut self, migratable: bool) -> Self {
        self.migratable = migratable;
        self
    }

    /// Run the ULT on caller-provided stack memory. The runtime never frees
    /// it.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be writable, unaliased for the lifetime of
    /// the ULT, and large enough for the ULT's frames.
    #[must_use]
    pub unsafe fn raw_stack(mut self, base: *mut u8, size: usize) -> Self {
        let top = (base as usize + size) & !(weft_context::STACK_ALIGNMENT - 1);
        self.raw_stack = Some((top, size));
        self
    }
}

/// Create a yieldable unit. With `push`, the fresh unit is made READY and
/// pushed to `pool`; otherwise the caller transfers to it directly.
pub(crate) fn create_ult(
    pool: Option<&Pool>,
    body: Body,
    extra_kind: UnitKind,
    stack_size: usize,
    guard: StackGuard,
    push: bool,
) -> Result<UnitRef> {
    let stack = HeapStack::with_guard(stack_size, guard).map_err(|_| Error::Resource)?;
    create_ult_on(
        pool,
        body,
        extra_kind | UnitKind::MEM_DESC_STACK,
        StackSource::Heap(stack),
        push,
    )
}

fn create_ult_on(
    pool: Option<&Pool>,
    body: Body,
    extra_kind: UnitKind,
    stack: StackSource,
    push: bool,
) -> Result<UnitRef> {
    let top = stack.top().ok_or(Error::InvalidArg)?;
    let unit = Unit::new(
        UnitKind::THREAD | UnitKind::YIELDABLE | extra_kind,
        pool.cloned(),
        Some(body),
        Some(YieldCtx {
            mctx: Context::unbound(),
            stack,
        }),
    );
    let r = UnitRef::alloc(unit);
    // Safety: the stack is owned by the descriptor and outlives the context;
    // the argument is the descriptor itself, kept live by `r`.
    unsafe {
        r.yctx()
            .mctx
            .bind(top, ult::ult_entry, r.as_ptr().as_ptr().cast());
    }
    tool::emit(tool::ToolEventKind::Create, &r);
    if push {
        ult::push_ready(r.clone(), PoolContext::OP_CREATE);
    }
    Ok(r)
}

/// Create a descriptor-only yieldable unit wrapping an existing OS stack
/// (primary and root units never get a fresh stack).
pub(crate) fn create_wrapper_ult(extra_kind: UnitKind, pool: Option<&Pool>) -> UnitRef {
    let unit = Unit::new(
        UnitKind::THREAD | UnitKind::YIELDABLE | UnitKind::MEM_DESC | extra_kind,
        pool.cloned(),
        None,
        Some(YieldCtx {
            mctx: Context::unbound(),
            stack: StackSource::OsThread,
        }),
    );
    UnitRef::alloc(unit)
}

pub(crate) fn create_tasklet(pool: &Pool, body: Body, push: bool) -> Result<UnitRef> {
    let unit = Unit::new(
        UnitKind::THREAD | UnitKind::MEM_DESC | UnitKind::NAMED,
        Some(pool.clone()),
        Some(body),
        None,
    );
    let r = UnitRef::alloc(unit);
    tool::emit(tool::ToolEventKind::Create, &r);
    if push {
        ult::push_ready(r.clone(), PoolContext::OP_CREATE);
    }
    Ok(r)
}

// === join / cancel / revive ================================================

/// Join a unit: block until it is TERMINATED.
pub(crate) fn join_unit(unit: &UnitRef) -> Result<()> {
    if unit.state() == UnitState::Terminated {
        tool::emit(tool::ToolEventKind::Join, unit);
        return Ok(());
    }
    if unit
        .kind()
        .intersects(UnitKind::PRIMARY | UnitKind::ROOT | UnitKind::MAIN_SCHED)
    {
        return Err(Error::InvalidArg);
    }

    let self_unit = local::current().and_then(XstreamInner::current_unit);
    match self_unit {
        Some(cur) if cur == unit.as_ptr() => return Err(Error::InvalidArg),
        // Safety: the current unit is live while this code runs on it.
        Some(cur) if unsafe { cur.as_ref() }.is_yieldable() => {
            join_on_ult(unit, cur);
        }
        // Tasklet context or external thread: park passively.
        _ => join_parked(unit),
    }
    tool::emit(tool::ToolEventKind::Join, unit);
    Ok(())
}

/// Yieldable joiner: publish ourselves on the target's join link and suspend;
/// fall back to yield-polling when another joiner won the race. The target
/// resumes us slightly before (or as) it fully terminates, so we poll the
/// state to finish.
fn join_on_ult(unit: &UnitRef, cur: NonNull<Unit>) {
    if unit.is_yieldable() {
        let prev = Request::from_bits_retain(
            unit.request.fetch_or(Request::JOIN.bits(), Ordering::AcqRel),
        );
        if !prev.contains(Request::JOIN) {
            ult::suspend_join(unit);
        }
    }
    while unit.state() != UnitState::Terminated {
        ult::yield_now_internal(cur);
    }
}

/// External-thread (or tasklet-context) joiner: sleep on a park cell hooked
/// into the target's join link, then spin out the final state store.
fn join_parked(unit: &UnitRef) {
    if unit.is_yieldable() {
        let prev = Request::from_bits_retain(
            unit.request.fetch_or(Request::JOIN.bits(), Ordering::AcqRel),
        );
        if !prev.contains(Request::JOIN) {
            let cell = ParkCell::new();
            let encoded = encode_ext_link(&raw const cell);
            if unit
                .link
                .compare_exchange(LINK_NONE, encoded, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                cell.wait();
            }
        }
    }
    while unit.state() != UnitState::Terminated {
        core::hint::spin_loop();
    }
}

pub(crate) fn cancel_unit(unit: &UnitRef) -> Result<()> {
    if unit
        .kind()
        .intersects(UnitKind::PRIMARY | UnitKind::ROOT | UnitKind::MAIN_SCHED)
    {
        return Err(Error::InvalidArg);
    }
    unit.request.fetch_or(Request::CANCEL.bits(), Ordering::Release);
    Ok(())
}

/// Reuse a TERMINATED descriptor (and stack) for a fresh body.
pub(crate) fn revive_unit(pool: &Pool, body: Body, unit: &UnitRef, transfer: bool) -> Result<()> {
    if unit.state() != UnitState::Terminated {
        return Err(Error::InvalidState);
    }
    unit.request.store(0, Ordering::Relaxed);
    unit.parent.store(ptr::null_mut(), Ordering::Relaxed);
    unit.link.store(LINK_NONE, Ordering::Relaxed);
    unit.token.store(0, Ordering::Relaxed);
    *unit.pool.lock() = Some(pool.clone());
    // Safety: a TERMINATED unit has no frame on its stack and no other
    // accessor of `body`.
    unsafe { *unit.body.get() = Some(body) };
    if unit.is_yieldable() {
        let top = unit.yctx().stack.top().ok_or(Error::InvalidState)?;
        // Safety: the stack is still owned by the descriptor; the old
        // context is dead.
        unsafe {
            unit.yctx()
                .mctx
                .bind(top, ult::ult_entry, unit.as_ptr().as_ptr().cast());
        }
    }
    unit.state.store(UnitState::Ready as u8, Ordering::Relaxed);
    tool::emit(tool::ToolEventKind::Revive, unit);
    if transfer {
        ult::transfer_to_fresh(unit)
    } else {
        ult::push_ready(unit.clone(), PoolContext::OP_REVIVE);
        Ok(())
    }
}

// === migration =============================================================

pub(crate) fn migrate_to_pool(unit: &UnitRef, pool: &Pool) -> Result<()> {
    if !unit.kind().contains(UnitKind::MIGRATABLE)
        || unit
            .kind()
            .intersects(UnitKind::PRIMARY | UnitKind::ROOT | UnitKind::MAIN_SCHED)
    {
        return Err(Error::MigrationNa);
    }
    if unit.state() == UnitState::Terminated {
        return Err(Error::InvalidState);
    }
    if let Some(current) = unit.pool_clone() {
        if current == *pool {
            return Err(Error::MigrationNa);
        }
    }
    let mig = unit.mig_data();
    *mig.target.lock() = Some(pool.clone());
    unit.request.fetch_or(Request::MIGRATE.bits(), Ordering::Release);
    tracing::debug!(id = unit.id(), pool = pool.id(), "migration requested");
    Ok(())
}

pub(crate) fn migrate_to_xstream(unit: &UnitRef, xstream: &Xstream) -> Result<()> {
    let sched = xstream.main_sched().ok_or(Error::InvalidState)?;
    let from = unit.pool_clone().ok_or(Error::InvalidHandle)?;
    let target = sched.migration_pool(&from).ok_or(Error::MigrationNa)?;
    migrate_to_pool(unit, &target)
}

pub(crate) fn migrate_to_sched(unit: &UnitRef, sched: &Sched) -> Result<()> {
    let from = unit.pool_clone().ok_or(Error::InvalidHandle)?;
    let target = sched.migration_pool(&from).ok_or(Error::MigrationNa)?;
    migrate_to_pool(unit, &target)
}

/// Migrate to any other execution stream, if one exists.
pub(crate) fn migrate_anywhere(unit: &UnitRef) -> Result<()> {
    let last = unit.last_stream.load(Ordering::Relaxed).cast_const();
    let streams = global::streams();
    for xs in &streams {
        if ptr::eq(xs.inner_ptr(), last) {
            continue;
        }
        if xs.state() == crate::xstream::XstreamState::Terminated {
            continue;
        }
        return migrate_to_xstream(unit, xs);
    }
    Err(Error::MigrationNa)
}

// === public handles ========================================================

/// A yieldable user-level thread.
#[derive(Clone)]
pub struct Ult {
    pub(crate) r: UnitRef,
}

/// A non-yieldable work unit, run to completion on its dispatcher's stack.
#[derive(Clone)]
pub struct Tasklet {
    pub(crate) r: UnitRef,
}

/// Any work unit, as popped from a pool.
#[derive(Clone)]
pub struct AnyUnit {
    pub(crate) r: UnitRef,
}

impl Ult {
    /// Create a ULT in `pool` with default attributes.
    pub fn create<F>(pool: &Pool, f: F) -> Result<Ult>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::create_with(pool, f, &UltAttrs::default())
    }

    pub fn create_with<F>(pool: &Pool, f: F, attrs: &UltAttrs) -> Result<Ult>
    where
        F: FnOnce() + Send + 'static,
    {
        global::ensure_init()?;
        let mut kind = UnitKind::NAMED;
        if attrs.migratable {
            kind |= UnitKind::MIGRATABLE;
        }
        let r = if let Some((top, size)) = attrs.raw_stack {
            create_ult_on(
                Some(pool),
                Box::new(f),
                kind | UnitKind::MEM_USER_STACK,
                StackSource::Raw { top, size },
                true,
            )?
        } else {
            let stack_size = attrs
                .stack_size
                .unwrap_or_else(|| global::config().thread_stack_size);
            create_ult(Some(pool), Box::new(f), kind, stack_size, attrs.guard, true)?
        };
        Ok(Ult { r })
    }

    /// Create a ULT in the first pool of `xstream`'s main scheduler.
    pub fn create_on_xstream<F>(xstream: &Xstream, f: F) -> Result<Ult>
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = xstream.main_pool().ok_or(Error::InvalidState)?;
        Self::create(&pool, f)
    }

    /// Create a ULT and transfer to it immediately, bypassing its pool. The
    /// calling ULT is pushed back to its own pool as if it had yielded.
    pub fn create_to<F>(pool: &Pool, f: F) -> Result<Ult>
    where
        F: FnOnce() + Send + 'static,
    {
        global::ensure_init()?;
        let kind = UnitKind::NAMED | UnitKind::MIGRATABLE;
        let stack_size = global::config().thread_stack_size;
        let r = create_ult(
            Some(pool),
            Box::new(f),
            kind,
            stack_size,
            StackGuard::Page,
            false,
        )?;
        ult::transfer_to_fresh(&r)?;
        Ok(Ult { r })
    }

    /// Rebuild a terminated ULT with a fresh body and push it to `pool`.
    pub fn revive<F>(&self, pool: &Pool, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        global::ensure_init()?;
        revive_unit(pool, Box::new(f), &self.r, false)
    }

    /// As [`revive`](Self::revive), but transfer to the revived ULT
    /// immediately.
    pub fn revive_to<F>(&self, pool: &Pool, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        global::ensure_init()?;
        revive_unit(pool, Box::new(f), &self.r, true)
    }

    /// Block until this ULT terminates.
    pub fn join(&self) -> Result<()> {
        global::ensure_init()?;
        join_unit(&self.r)
    }

    /// Join, then release this handle's reference to the descriptor.
    pub fn free(self) -> Result<()> {
        global::ensure_init()?;
        if let Some(cur) = local::current().and_then(XstreamInner::current_unit) {
            if cur == self.r.as_ptr() {
                return Err(Error::InvalidArg);
            }
        }
        join_unit(&self.r)?;
        tool::emit(tool::ToolEventKind::Free, &self.r);
        drop(self);
        Ok(())
    }

    /// Request cooperative cancellation; observed at the target's next
    /// context edge.
    pub fn cancel(&self) -> Result<()> {
        global::ensure_init()?;
        cancel_unit(&self.r)
    }

    /// Make a ULT blocked by [`current::suspend`](crate::current::suspend)
    /// ready and push it to its pool.
    pub fn resume(&self) -> Result<()> {
        global::ensure_init()?;
        if self.r.state() != UnitState::Blocked {
            return Err(Error::InvalidState);
        }
        ult::resume_and_push(self.r.clone());
        Ok(())
    }

    /// Yield the calling ULT directly to this one. See
    /// [`current::yield_to`](crate::current::yield_to).
    pub fn yield_to(&self) -> Result<()> {
        crate::current::yield_to(self)
    }

    pub fn migrate_to_pool(&self, pool: &Pool) -> Result<()> {
        global::ensure_init()?;
        migrate_to_pool(&self.r, pool)
    }

    pub fn migrate_to_xstream(&self, xstream: &Xstream) -> Result<()> {
        global::ensure_init()?;
        migrate_to_xstream(&self.r, xstream)
    }

    pub fn migrate_to_sched(&self, sched: &Sched) -> Result<()> {
        global::ensure_init()?;
        migrate_to_sched(&self.r, sched)
    }

    /// Migrate to any other execution stream.
    pub fn migrate(&self) -> Result<()> {
        global::ensure_init()?;
        migrate_anywhere(&self.r)
    }

    pub fn set_migratable(&self, migratable: bool) -> Result<()> {
        if self
            .r
            .kind()
            .intersects(UnitKind::PRIMARY | UnitKind::ROOT | UnitKind::MAIN_SCHED)
        {
            return Err(Error::InvalidArg);
        }
        if migratable {
            self.r.add_kind(UnitKind::MIGRATABLE);
        } else {
            self.r.remove_kind(UnitKind::MIGRATABLE);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_migratable(&self) -> bool {
        self.r.kind().contains(UnitKind::MIGRATABLE)
    }

    /// Install a callback invoked once per completed migration of this ULT.
    pub fn set_callback<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Ult) + Send + 'static,
    {
        *self.r.mig_data().callback.lock() = Some(Box::new(f));
        Ok(())
    }

    /// Re-associate this unit with `pool` without migrating it. The unit must
    /// not currently be queued.
    pub fn set_associated_pool(&self, pool: &Pool) -> Result<()> {
        if self.r.is_in_pool.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        *self.r.pool.lock() = Some(pool.clone());
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> UnitState {
        self.r.state()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.r.id()
    }

    /// The pool this unit is associated with.
    #[must_use]
    pub fn last_pool(&self) -> Option<Pool> {
        self.r.pool_clone()
    }

    /// Rank of the stream this unit last ran on.
    #[must_use]
    pub fn last_xstream_rank(&self) -> Option<i32> {
        let ptr = self.r.last_stream.load(Ordering::Acquire);
        // Safety: stream descriptors outlive the units that ran on them.
        NonNull::new(ptr).map(|p| unsafe { p.as_ref() }.rank())
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.r.kind().contains(UnitKind::PRIMARY)
    }

    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.r.yctx().stack.size()
    }
}

impl PartialEq for Ult {
    fn eq(&self, other: &Self) -> bool {
        self.r.ptr_eq(&other.r)
    }
}
impl Eq for Ult {}

impl fmt::Debug for Ult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ult").field(&*self.r).finish()
    }
}

impl Tasklet {
    pub fn create<F>(pool: &Pool, f: F) -> Result<Tasklet>
    where
        F: FnOnce() + Send + 'static,
    {
        global::ensure_init()?;
        let r = create_tasklet(pool, Box::new(f), true)?;
        Ok(Tasklet { r })
    }

    pub fn join(&self) -> Result<()> {
        global::ensure_init()?;
        join_unit(&self.r)
    }

    pub fn free(self) -> Result<()> {
        global::ensure_init()?;
        join_unit(&self.r)?;
        tool::emit(tool::ToolEventKind::Free, &self.r);
        drop(self);
        Ok(())
    }

    pub fn cancel(&self) -> Result<()> {
        global::ensure_init()?;
        cancel_unit(&self.r)
    }

    #[must_use]
    pub fn state(&self) -> UnitState {
        self.r.state()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.r.id()
    }
}

impl PartialEq for Tasklet {
    fn eq(&self, other: &Self) -> bool {
        self.r.ptr_eq(&other.r)
    }
}
impl Eq for Tasklet {}

impl fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tasklet").field(&*self.r).finish()
    }
}

impl AnyUnit {
    pub(crate) fn from_ref(r: UnitRef) -> Self {
        Self { r }
    }

    #[must_use]
    pub fn state(&self) -> UnitState {
        self.r.state()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.r.id()
    }

    #[must_use]
    pub fn is_ult(&self) -> bool {
        self.r.is_yieldable()
    }

    #[must_use]
    pub fn as_ult(&self) -> Option<Ult> {
        self.r.is_yieldable().then(|| Ult { r: self.r.clone() })
    }

    #[must_use]
    pub fn as_tasklet(&self) -> Option<Tasklet> {
        (!self.r.is_yieldable()).then(|| Tasklet { r: self.r.clone() })
    }
}

impl fmt::Debug for AnyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyUnit").field(&*self.r).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_encoding_roundtrip() {
        assert!(matches!(decode_link(LINK_NONE), LinkTarget::None));
        assert!(matches!(decode_link(LINK_TERMINATED), LinkTarget::Terminated));

        let cell = ParkCell::new();
        let encoded = encode_ext_link(&raw const cell);
        match decode_link(encoded) {
            LinkTarget::Ext(ptr) => assert!(core::ptr::eq(ptr, &raw const cell)),
            _ => panic!("expected external link"),
        }
    }

    #[test]
    fn unit_ids_are_unique_and_sticky() {
        let a = UnitRef::alloc(Unit::new(UnitKind::THREAD, None, None, None));
        let b = UnitRef::alloc(Unit::new(UnitKind::THREAD, None, None, None));
        let id_a = a.id();
        assert_eq!(a.id(), id_a);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn refcount_drops_descriptor_once() {
        let a = UnitRef::alloc(Unit::new(UnitKind::THREAD, None, None, None));
        let b = a.clone();
        drop(a);
        assert_eq!(b.kind(), UnitKind::THREAD);
        drop(b);
    }
}
