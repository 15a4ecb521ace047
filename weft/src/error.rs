// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Errors returned by the runtime.
///
/// A successful call never reports an error; operations that reach a point of
/// no return (a completed context transfer) cannot fail afterwards, so every
/// variant below is raised before any user-visible state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The runtime is not initialized (or was finalized).
    Uninitialized,
    /// A bad argument value.
    InvalidArg,
    /// A null or stale handle.
    InvalidHandle,
    /// The operation is forbidden in the object's current state.
    InvalidState,
    /// The operation is forbidden in the calling execution context.
    InvalidContext,
    /// Memory or stack allocation failed.
    Resource,
    /// Migration is not possible for this unit or no valid target exists.
    MigrationNa,
    /// The capability is not provided (e.g. an optional pool operation).
    FeatureNa,
    /// A `try_lock` found the lock held.
    LockBusy,
    /// A timed wait expired.
    TimedOut,
    /// An underlying OS call failed.
    Sys(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Uninitialized => f.write_str("runtime is not initialized"),
            Error::InvalidArg => f.write_str("invalid argument"),
            Error::InvalidHandle => f.write_str("invalid handle"),
            Error::InvalidState => f.write_str("operation forbidden in the current state"),
            Error::InvalidContext => {
                f.write_str("operation forbidden in the calling execution context")
            }
            Error::Resource => f.write_str("resource allocation failed"),
            Error::MigrationNa => f.write_str("migration not available"),
            Error::FeatureNa => f.write_str("feature not available"),
            Error::LockBusy => f.write_str("lock is busy"),
            Error::TimedOut => f.write_str("timed out"),
            Error::Sys(errno) => write!(f, "system call failed (errno {errno})"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T, E = Error> = core::result::Result<T, E>;
