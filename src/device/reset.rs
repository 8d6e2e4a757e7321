//! Device-reset exclusion.
//!
//! Fault service takes the shared side; a reset takes the exclusive side.
//! The shared acquisition fails transiently while a reset is in progress,
//! turning the fault into a silent retry.

use crate::error::{MapError, MapResult};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
pub struct ResetBarrier {
    lock: RwLock<()>,
}

impl ResetBarrier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Shared side, taken per fault.
    ///
    /// # Errors
    /// `DeviceBusy` while a reset holds the exclusive side.
    pub(crate) fn lock_shared(&self) -> MapResult<ResetGuard<'_>> {
        match self.lock.try_read() {
            Ok(guard) => Ok(ResetGuard { _guard: guard }),
            Err(_) => Err(MapError::DeviceBusy),
        }
    }

    /// Exclusive side, held for the duration of a device reset.
    pub fn begin_reset(&self) -> ResetExclusive<'_> {
        ResetExclusive {
            _guard: self.lock.write().unwrap(),
        }
    }
}

pub struct ResetGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

pub struct ResetExclusive<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}
