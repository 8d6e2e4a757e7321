//! Fault entry points and outcome translation.
//!
//! Resolver errors never surface raw: every fault ends as one of three
//! outcomes — silently retryable, out-of-memory, or an unrecoverable bus
//! error terminating the access.

mod aperture;
mod direct;
pub mod swap;
pub mod view;

use crate::PAGE_SHIFT;
use crate::device::context::DeviceContext;
use crate::error::{MapError, MapResult};
use crate::mmap::MapKind;
use crate::txn;
use std::sync::{Arc, Once};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Entries populated; the access proceeds.
    Done,
    /// Benign race or transient contention; refault without progress.
    Retry,
    OutOfMemory,
    /// Unrecoverable; the access is terminated.
    BusError,
}

/// Service a page fault at `address`, routed by the mapping kind.
pub fn handle_fault(ctx: &DeviceContext, address: u64, is_write: bool) -> FaultOutcome {
    let Some(area) = ctx.singleton.lookup(address) else {
        return FaultOutcome::BusError;
    };
    if is_write && !area.writable {
        return FaultOutcome::BusError;
    }

    let result = match area.kind {
        MapKind::Aperture => aperture::resolve_fault(ctx, &area, address, is_write),
        _ => direct::resolve_fault_direct(ctx, &area, address, is_write),
    };
    outcome(result)
}

fn outcome(result: MapResult<()>) -> FaultOutcome {
    match result {
        Ok(()) => FaultOutcome::Done,
        Err(MapError::DeviceBusy | MapError::Backoff) => FaultOutcome::Retry,
        Err(MapError::ResourceExhausted) => FaultOutcome::OutOfMemory,
        Err(
            MapError::NotFound
            | MapError::AccessDenied
            | MapError::Unsupported
            | MapError::FatalAccess,
        ) => FaultOutcome::BusError,
        Err(MapError::Io(err)) => {
            static WARN_ONCE: Once = Once::new();
            WARN_ONCE.call_once(|| log::warn!("unhandled error in fault service: {err}"));
            FaultOutcome::BusError
        }
    }
}

/// Debug read through a mapping, independent of populated entries.
///
/// # Errors
/// `NotFound` outside any view; `Unsupported` for ranges overflowing the
/// object or crossing segment bounds.
pub fn access_read(ctx: &DeviceContext, address: u64, buf: &mut [u8]) -> MapResult<usize> {
    let (obj, offset) = locate(ctx, address, buf.len() as u64)?;
    txn::run(|t| {
        let _resv = t.lock(&obj.resv)?;
        let _pin = obj.pin_pages_sync()?;
        obj.with_vmap(|bytes| {
            let offset = offset as usize;
            buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        });
        Ok(buf.len())
    })
}

/// Debug write counterpart of [`access_read`].
///
/// # Errors
/// `AccessDenied` for read-only objects, otherwise as [`access_read`].
pub fn access_write(ctx: &DeviceContext, address: u64, buf: &[u8]) -> MapResult<usize> {
    let (obj, offset) = locate(ctx, address, buf.len() as u64)?;
    if obj.is_readonly() {
        return Err(MapError::AccessDenied);
    }
    txn::run(|t| {
        let _resv = t.lock(&obj.resv)?;
        let _pin = obj.pin_pages_sync()?;
        obj.with_vmap(|bytes| {
            let offset = offset as usize;
            bytes[offset..offset + buf.len()].copy_from_slice(buf);
        });
        Ok(buf.len())
    })
}

fn locate(
    ctx: &DeviceContext,
    address: u64,
    len: u64,
) -> MapResult<(Arc<crate::object::BufferObject>, u64)> {
    let area = ctx.singleton.lookup(address).ok_or(MapError::NotFound)?;
    let obj = Arc::clone(&area.object);
    let offset = (address - area.start) + (area.first_page << PAGE_SHIFT);
    if offset.checked_add(len).is_none_or(|end| end > obj.size) {
        return Err(MapError::Unsupported);
    }
    if obj.has_segments() {
        let (seg, seg_offset) = obj.lookup_segment(offset).ok_or(MapError::Unsupported)?;
        if len > seg.size - seg_offset {
            // Accesses spanning segments are not handled.
            return Err(MapError::Unsupported);
        }
        return Ok((seg, seg_offset));
    }
    Ok((obj, offset))
}
