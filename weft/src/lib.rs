// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! weft, a user-level threading runtime.
//!
//! weft multiplexes many lightweight cooperative work units over a small set
//! of OS-thread-backed *execution streams*. Work units come in two shapes:
//! yieldable ULTs ([`Ult`]) that own a private stack and can
//! yield/suspend/migrate, and run-to-completion tasklets ([`Tasklet`]) that
//! execute on their dispatcher's stack. Units are submitted to pluggable
//! [`pool`]s, which [`sched`]ulers drain; synchronization objects in
//! [`sync`] block ULTs cooperatively and park external threads passively.
//!
//! ```no_run
//! weft::init()?;
//!
//! let pool = weft::current::xstream().unwrap().main_pool().unwrap();
//! let ult = weft::Ult::create(&pool, || {
//!     println!("hello from a ULT");
//! })?;
//! ult.join()?;
//!
//! weft::finalize()?;
//! # Ok::<(), weft::Error>(())
//! ```

pub mod current;
mod error;
mod global;
mod key;
mod local;
mod loom;
mod park;
pub mod pool;
pub mod sched;
mod spin;
pub mod sync;
mod tool;
mod ult;
mod unit;
mod unit_map;
mod waitlist;
mod xstream;

pub use error::{Error, Result};
pub use global::{finalize, init, initialized};
pub use key::Key;
pub use pool::{Pool, PoolAccess, PoolCaps, PoolContext, UserPoolDef};
pub use sched::{Sched, SchedConfig, SchedKind, SchedOps, SchedUsed};
pub use tool::{set_tool_callback, ToolCallback, ToolEventKind, ToolEventMask};
pub use unit::{AnyUnit, Tasklet, Ult, UltAttrs, UnitState};
pub use weft_context::StackGuard;
pub use xstream::{Xstream, XstreamState};

use static_assertions::assert_impl_all;

assert_impl_all!(Ult: Send, Sync);
assert_impl_all!(Tasklet: Send, Sync);
assert_impl_all!(AnyUnit: Send, Sync);
assert_impl_all!(Pool: Send, Sync);
assert_impl_all!(Sched: Send, Sync);
assert_impl_all!(Xstream: Send, Sync);
assert_impl_all!(sync::Mutex: Send, Sync);
assert_impl_all!(sync::Condvar: Send, Sync);
assert_impl_all!(sync::Eventual<u64>: Send, Sync);
