// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! User-defined pools.
//!
//! A user pool stores opaque `u64` tokens of its own choosing. On push the
//! runtime asks the pool to mint a token for the unit and records the
//! token-to-descriptor association in the global unit map; a popped token is
//! resolved back through the map and released.

use crate::pool::{PoolCaps, PoolContext, PoolImpl};
use crate::unit::{AnyUnit, UnitRef};
use crate::{global, Error, Result};
use core::sync::atomic::Ordering;
use core::time::Duration;

/// Operations of a user-defined pool.
///
/// `create_unit`/`free_unit`, `push`, `pop` and `is_empty` are required; the
/// rest are optional and must be advertised via [`caps`](Self::caps) when
/// provided. Tokens must be non-zero and unique among the units currently in
/// the pool.
pub trait UserPoolDef: Send + Sync {
    /// Mint a token for a unit that is about to be pushed.
    fn create_unit(&self, unit: &AnyUnit) -> u64;
    /// Release a token that left the pool.
    fn free_unit(&self, token: u64);

    fn push(&self, token: u64, ctx: PoolContext);
    fn pop(&self, ctx: PoolContext) -> Option<u64>;
    fn is_empty(&self) -> bool;

    fn caps(&self) -> PoolCaps {
        PoolCaps::empty()
    }

    fn pop_wait(&self, _timeout: Duration, _ctx: PoolContext) -> Option<u64> {
        None
    }

    fn remove(&self, _token: u64) -> Result<()> {
        Err(Error::FeatureNa)
    }

    fn get_size(&self) -> Option<usize> {
        None
    }

    /// One-time setup, run at pool creation.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Teardown, run when the pool descriptor is released.
    fn free(&self) {}
}

pub(super) struct UserPool {
    def: Box<dyn UserPoolDef>,
}

impl UserPool {
    pub(super) fn new(def: Box<dyn UserPoolDef>) -> Self {
        Self { def }
    }

    fn resolve(&self, token: u64) -> Option<UnitRef> {
        let unit = global::unit_map()
            .remove(token)
            .expect("user pool returned a token it was never given");
        self.def.free_unit(token);
        unit.token.store(0, Ordering::Relaxed);
        Some(unit)
    }
}

impl PoolImpl for UserPool {
    fn push(&self, unit: UnitRef, ctx: PoolContext) {
        let handle = AnyUnit::from_ref(unit.clone());
        let token = self.def.create_unit(&handle);
        assert_ne!(token, 0, "user pool minted the reserved zero token");
        unit.token.store(token, Ordering::Relaxed);
        global::unit_map().insert(token, unit);
        self.def.push(token, ctx);
    }

    fn pop(&self, ctx: PoolContext) -> Option<UnitRef> {
        let token = self.def.pop(ctx)?;
        self.resolve(token)
    }

    fn pop_wait(&self, timeout: Duration, ctx: PoolContext) -> Option<UnitRef> {
        let token = self.def.pop_wait(timeout, ctx)?;
        self.resolve(token)
    }

    fn is_empty(&self) -> bool {
        self.def.is_empty()
    }

    fn caps(&self) -> PoolCaps {
        self.def.caps() & (PoolCaps::POP_WAIT | PoolCaps::REMOVE | PoolCaps::SIZE)
    }

    fn remove(&self, unit: &UnitRef) -> Result<()> {
        let token = unit.token.load(Ordering::Acquire);
        if token == 0 {
            return Err(Error::InvalidState);
        }
        self.def.remove(token)?;
        global::unit_map().remove(token);
        self.def.free_unit(token);
        unit.token.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> Option<usize> {
        self.def.get_size()
    }

    fn on_free(&self) {
        self.def.free();
    }
}
