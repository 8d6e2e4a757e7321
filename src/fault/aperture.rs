//! Aperture-bound fault resolution.
//!
//! Runs synchronously on the faulting thread: lock the object, pin its
//! pages, exclude device reset, bind into the aperture (falling back to a
//! partial view under pressure), arbitrate a fence, map the bound window
//! and register the mapping for revocation. Resources unwind in strict
//! reverse order on any failure.

use super::view::{MIN_CHUNK_PAGES, compute_partial_view};
use crate::PAGE_SHIFT;
use crate::aperture::{BindFlags, PinHold, View};
use crate::device::context::DeviceContext;
use crate::error::{MapError, MapResult};
use crate::mmap::singleton::VmArea;
use crate::object::{BufferObject, CacheLevel};
use crate::txn;
use std::sync::Arc;

pub(super) fn resolve_fault(
    ctx: &DeviceContext,
    area: &VmArea,
    address: u64,
    is_write: bool,
) -> MapResult<()> {
    let obj = &area.object;
    // Offset within the view, not the record's global offset.
    let page_offset = (address - area.start) >> PAGE_SHIFT;

    let _wakeref = ctx.power.wakeref();

    txn::run(|t| {
        let _resv = t.lock(&obj.resv)?;

        if obj.is_readonly() && is_write {
            return Err(MapError::AccessDenied);
        }

        let _pages = obj.pin_pages_sync()?;
        let _reset = ctx.reset.lock_shared()?;

        let hold = bind_ladder(ctx, obj, page_offset)?;

        // Snooped backing through the aperture is incoherent without a
        // covering last-level cache.
        if obj.cache == CacheLevel::Snooped && !ctx.caps.has_llc {
            return Err(MapError::FatalAccess);
        }

        // Tiled access needs a fence register; the pool is shared and may
        // displace a third party's binding.
        if obj.tiling.is_some() {
            ctx.aperture.pin_fence(&hold.pin, &ctx.singleton)?;
        }

        // Map the bound window at its place within the view.
        let view = hold.pin.view;
        let user_start = area.start + (view.offset << PAGE_SHIFT);
        let host_start = ctx.aperture.host_base() + (hold.pin.start_page() << PAGE_SHIFT);
        let pages = view.pages.min(area.pages.saturating_sub(view.offset));
        ctx.singleton.populate_range(user_start, host_start, pages);

        // Mark as mapped into userspace for later revocation, then keep
        // the power domain awake a little longer.
        ctx.aperture.mark_userfault(obj, &hold.pin);
        ctx.power.arm_userfault_autosuspend();

        if is_write {
            hold.pin.set_write_tracked();
        }
        Ok(())
    })
}

/// Full-object binding is always preferred: a partial binding leaves later
/// host writes untracked. Under pressure, fall back to a partial view,
/// first without eviction, then with eviction and full placement search.
fn bind_ladder(
    ctx: &DeviceContext,
    obj: &Arc<BufferObject>,
    page_offset: u64,
) -> MapResult<PinHold> {
    let full = View::full(obj.page_count());
    if let Ok(hold) = ctx.aperture.bind(
        obj,
        full,
        BindFlags::MAPPABLE | BindFlags::NONBLOCK | BindFlags::NOEVICT,
        &ctx.singleton,
    ) {
        return Ok(hold);
    }

    let view = compute_partial_view(obj, page_offset, MIN_CHUNK_PAGES);
    let mut flags = BindFlags::MAPPABLE | BindFlags::NOSEARCH;
    if view.is_full(obj.page_count()) {
        flags |= BindFlags::NONBLOCK;
    }
    if let Ok(hold) = ctx.aperture.bind(obj, view, flags, &ctx.singleton) {
        return Ok(hold);
    }

    ctx.aperture.bind(obj, view, BindFlags::MAPPABLE, &ctx.singleton)
}
