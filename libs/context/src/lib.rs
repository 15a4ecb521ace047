// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Machine-context switching for weft.
//!
//! This crate provides the [`Context`], an opaque per-architecture register
//! and stack descriptor used for direct transfers between user-level threads.
//! Unlike a resume/yield coroutine pair, contexts here are *symmetric*: any
//! suspended context can be resumed from any other, and a context adopting the
//! calling OS thread's stack is just a [`Context`] that has not been bound to
//! a fresh stack.
//!
//! The register discipline is taken from the `fiber` crate (which in turn
//! follows [`corosensei`]): the LLVM-reserved callee-saved registers are
//! saved by hand in the switch sequence, the rest are declared as clobbers so
//! the compiler only spills what is live.
//!
//! [`corosensei`]: https://github.com/Amanieu/corosensei

mod arch;
pub mod stack;

use core::sync::atomic::{AtomicUsize, Ordering};

pub use crate::arch::STACK_ALIGNMENT;
pub use crate::stack::{HeapStack, Stack, StackGuard, StackPointer};

/// Entry function of a fresh context. Receives the argument given to
/// [`Context::bind`] and must never return; leaving the context is done by
/// switching or jumping away.
pub type Entry = unsafe extern "C" fn(*mut ()) -> !;

/// A one-slot machine context.
///
/// The slot holds the stack pointer at which the suspended state lives, or 0
/// while the context is running (or was never entered). The slot is a relaxed
/// atomic only so that descriptors embedding a `Context` can be shared across
/// OS threads; *happens-before* between the thread that suspends a context and
/// the thread that later resumes it must be established externally (in weft,
/// by the pool or wait-list lock that publishes the unit).
#[derive(Debug)]
pub struct Context {
    sp: AtomicUsize,
}

impl Context {
    /// A context with no saved state.
    ///
    /// Used for work units that run on a stack the runtime does not own (the
    /// primary ULT, root ULTs): the slot is filled the first time the unit
    /// switches away.
    #[must_use]
    pub const fn unbound() -> Self {
        Self {
            sp: AtomicUsize::new(0),
        }
    }

    /// Set up `entry(arg)` to run on the stack whose base is `stack_top`.
    ///
    /// The first switch into this context lands in a trampoline that calls
    /// `entry` with an ABI-aligned stack and a terminated frame chain.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the [`STACK_ALIGNMENT`]-aligned base of a mapped,
    /// writable stack that stays valid until the context finishes or is
    /// dropped, and the context must not currently be suspended on another
    /// stack. `arg` must be valid for whatever `entry` does with it.
    pub unsafe fn bind(&self, stack_top: StackPointer, entry: Entry, arg: *mut ()) {
        debug_assert_eq!(stack_top.get() % STACK_ALIGNMENT, 0);
        // Safety: ensured by caller
        let sp = unsafe { arch::init_stack(stack_top, entry, arg) };
        self.sp.store(sp.get(), Ordering::Relaxed);
    }

    /// Whether the context currently holds suspended state.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.sp.load(Ordering::Relaxed) != 0
    }

    /// Suspend the calling context into `from` and resume `to`.
    ///
    /// Returns when some other context switches (or jumps) back into `from`.
    ///
    /// # Safety
    ///
    /// `to` must hold a suspended context, `from` must be the context the
    /// caller is actually running on, and nothing else may resume either
    /// concurrently. Thread-local addresses obtained before this call must
    /// not be reused after it: the caller may be resumed on a different OS
    /// thread.
    pub unsafe fn switch(from: &Context, to: &Context) {
        let target = to.sp.swap(0, Ordering::Relaxed);
        debug_assert_ne!(target, 0, "switch into a context that is not suspended");
        // Safety: `target` was a live stack pointer per the caller contract;
        // `from.sp` is a valid slot for the switch sequence to fill.
        unsafe {
            arch::switch(from.sp.as_ptr(), StackPointer::new_unchecked(target));
        }
    }

    /// Resume `to`, abandoning the calling context.
    ///
    /// The current stack is left as-is and never returned to; the caller is
    /// responsible for any cleanup of it (typically from the resumed side).
    ///
    /// # Safety
    ///
    /// `to` must hold a suspended context and nothing else may resume it
    /// concurrently.
    pub unsafe fn jump(to: &Context) -> ! {
        let target = to.sp.swap(0, Ordering::Relaxed);
        debug_assert_ne!(target, 0, "jump into a context that is not suspended");
        // Safety: ensured by caller
        unsafe { arch::jump(StackPointer::new_unchecked(target)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Shared {
        main: Context,
        child: Context,
        hits: Cell<u32>,
    }

    unsafe extern "C" fn child_entry(arg: *mut ()) -> ! {
        // Safety: `arg` points at the `Shared` owned by the test below, which
        // outlives the child context.
        let shared = unsafe { &*arg.cast::<Shared>() };

        shared.hits.set(shared.hits.get() + 1);
        // Safety: the test is suspended in `main` at this point.
        unsafe { Context::switch(&shared.child, &shared.main) };

        shared.hits.set(shared.hits.get() + 1);
        // Safety: as above; the child context is abandoned here.
        unsafe { Context::jump(&shared.main) }
    }

    #[test]
    fn switch_roundtrip() {
        let stack = HeapStack::new(64 * 1024).unwrap();
        let shared = Box::new(Shared {
            main: Context::unbound(),
            child: Context::unbound(),
            hits: Cell::new(0),
        });

        // Safety: the stack outlives the child context, and `shared` outlives
        // both contexts.
        unsafe {
            shared.child.bind(
                stack.top(),
                child_entry,
                core::ptr::from_ref::<Shared>(&shared).cast_mut().cast(),
            );
        }

        assert!(shared.child.is_suspended());
        // Safety: child is suspended, main is the running context.
        unsafe { Context::switch(&shared.main, &shared.child) };
        assert_eq!(shared.hits.get(), 1);

        // Safety: the child suspended itself by switching back to main.
        unsafe { Context::switch(&shared.main, &shared.child) };
        assert_eq!(shared.hits.get(), 2);
        assert!(!shared.child.is_suspended());
    }

    #[test]
    fn fresh_context_is_suspended() {
        let stack = HeapStack::new(32 * 1024).unwrap();
        let ctx = Context::unbound();
        assert!(!ctx.is_suspended());
        // Safety: the context is never entered, so the entry is irrelevant.
        unsafe { ctx.bind(stack.top(), child_entry, core::ptr::null_mut()) };
        assert!(ctx.is_suspended());
    }
}
