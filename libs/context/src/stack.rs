// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stacks for machine contexts.

use std::io::Error;
use std::ptr;

pub(crate) use crate::arch::STACK_ALIGNMENT;

pub type StackPointer = core::num::NonZeroUsize;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

/// Whether a [`HeapStack`] carries an inaccessible guard page at its limit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StackGuard {
    /// One `PROT_NONE` page below the usable range; overflow faults instead
    /// of corrupting adjacent memory.
    #[default]
    Page,
    /// No guard page. Overflow behavior is undefined.
    None,
}

/// A region of memory usable as a context stack.
///
/// # Safety
///
/// `top` must be the highest address of a mapped, writable region reaching
/// down to (at least) `bottom`, and must be aligned to [`STACK_ALIGNMENT`].
pub unsafe trait Stack {
    /// Returns the highest address (start address) of the stack.
    fn top(&self) -> StackPointer;

    /// Returns the lowest address (maximum limit) of the stack, including any
    /// guard pages.
    fn bottom(&self) -> StackPointer;

    /// Usable size in bytes, excluding guard pages.
    fn size(&self) -> usize;
}

/// An `mmap`-allocated stack with an optional guard page.
pub struct HeapStack {
    top: StackPointer,
    mmap_len: usize,
    size: usize,
}

impl HeapStack {
    /// Creates a new stack with at least the given usable capacity and the
    /// default guard configuration.
    pub fn new(size: usize) -> std::io::Result<Self> {
        Self::with_guard(size, StackGuard::default())
    }

    pub fn with_guard(size: usize, guard: StackGuard) -> std::io::Result<Self> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Round the size up to a page boundary, plus a guard page if one was
        // requested.
        let page_size = page_size();
        let guard_len = match guard {
            StackGuard::Page => page_size,
            StackGuard::None => 0,
        };
        let mmap_len = size
            .checked_add(guard_len + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping with no fixed address; the result is
        // checked before use.
        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here. If the mprotect call fails then this
            // will be dropped and the memory will be unmapped.
            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
                size: mmap_len - guard_len,
            };

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(guard_len).cast(),
                mmap_len - guard_len,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }
}

impl Drop for HeapStack {
    fn drop(&mut self) {
        let mmap = self.top.get() - self.mmap_len;
        // Safety: `mmap..mmap_len` is the region mapped in `with_guard` and
        // is not referenced anymore.
        let ret = unsafe { libc::munmap(mmap as _, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

// Safety: the mapping created in `with_guard` satisfies the trait contract;
// `top` is page-aligned and pages are aligned far beyond STACK_ALIGNMENT.
unsafe impl Stack for HeapStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len).unwrap()
    }

    fn size(&self) -> usize {
        self.size
    }
}

// Safety: a HeapStack is just an owned mapping; it carries no thread affinity.
unsafe impl Send for HeapStack {}

fn page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) has no preconditions.
    let pagesize = usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap();
    assert!(pagesize.is_power_of_two());
    pagesize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_aligned_and_sized() {
        let stack = HeapStack::new(40_000).unwrap();
        assert_eq!(stack.top().get() % STACK_ALIGNMENT, 0);
        assert!(stack.size() >= 40_000);
        assert!(stack.top().get() - stack.bottom().get() >= stack.size());
    }

    #[test]
    fn unguarded_stack() {
        let stack = HeapStack::with_guard(MIN_STACK_SIZE, StackGuard::None).unwrap();
        assert_eq!(stack.top().get() - stack.bottom().get(), stack.size());
    }
}
