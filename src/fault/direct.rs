//! Direct (host-visible) fault resolution.
//!
//! Services faults for objects reachable without the aperture: system
//! pages, or device memory exposed through a fixed I/O window. Applies the
//! swap/migration policy, then pins, populates the fault window from the
//! resident scatter-gather list and unpins; the populated entries stay
//! valid until explicitly revoked.

use super::swap;
use crate::PAGE_SHIFT;
use crate::device::context::DeviceContext;
use crate::error::{MapError, MapResult};
use crate::fault::swap::MigrateDecision;
use crate::mmap::singleton::VmArea;
use crate::object::BufferObject;
use crate::txn;
use std::sync::Arc;

/// Fault window in user and object page space.
struct Window {
    user_start: u64,
    obj_base: u64,
    pages: u64,
}

pub(super) fn resolve_fault_direct(
    ctx: &DeviceContext,
    area: &VmArea,
    address: u64,
    is_write: bool,
) -> MapResult<()> {
    let parent = Arc::clone(&area.object);

    if parent.is_readonly() && is_write {
        return Err(MapError::AccessDenied);
    }

    let _active = ctx.faults.enter();

    // Bail out while a device-wide invalidation is in flight.
    if ctx.is_revoking() {
        return Err(MapError::FatalAccess);
    }

    let fault_page = area.first_page + ((address - area.start) >> PAGE_SHIFT);

    // For segmented objects, resolve and fill just the owning segment.
    let (target, window) = if parent.has_segments() {
        let Some((seg, _)) = parent.lookup_segment(fault_page << PAGE_SHIFT) else {
            return Err(MapError::FatalAccess);
        };
        let Some(link) = seg.segment.as_ref() else {
            return Err(MapError::FatalAccess);
        };
        let seg_first = link.offset >> PAGE_SHIFT;
        let lo = seg_first.max(area.first_page);
        let hi = (seg_first + seg.page_count()).min(area.first_page + area.pages);
        if lo >= hi {
            return Err(MapError::FatalAccess);
        }
        let window = Window {
            user_start: area.start + ((lo - area.first_page) << PAGE_SHIFT),
            obj_base: lo - seg_first,
            pages: hi - lo,
        };
        (Arc::clone(&seg), window)
    } else {
        let hi = (area.first_page + area.pages).min(parent.page_count());
        let window = Window {
            user_start: area.start,
            obj_base: area.first_page,
            pages: hi.saturating_sub(area.first_page),
        };
        (Arc::clone(&parent), window)
    };

    txn::run(|t| {
        let _resv = t.lock(&target.resv)?;

        // Possibly substitute a shadow backing; it shares the reservation,
        // so it is already covered by the lock above.
        let pg = swap::apply(ctx, &target, is_write);

        match swap::migrate_intent(&swap::migrate_snapshot(&pg)) {
            MigrateDecision::Required => {
                if pg.has_pinned_pages() {
                    // A retry of fault + migration would refault forever;
                    // fail the access instead.
                    return Err(MapError::FatalAccess);
                }
                pg.migrate_to_system(&ctx.system_region)?;
            }
            MigrateDecision::Optional => {
                if !pg.has_pinned_pages() {
                    if let Err(err) = pg.migrate_to_system(&ctx.system_region) {
                        log::debug!("best-effort migration skipped: {err}");
                    }
                }
            }
            MigrateDecision::No => {}
        }

        // Pin, populate, unpin. Transient no-device / out-of-memory races
        // are retried a bounded number of times around the whole step.
        let mut attempts = 0;
        loop {
            let pin = match pg.pin_pages_sync() {
                Ok(pin) => pin,
                Err(err @ (MapError::ResourceExhausted | MapError::DeviceBusy))
                    if attempts < 2 =>
                {
                    attempts += 1;
                    log::debug!("transient pin failure, retrying: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let res = populate_window(ctx, &pg, &window);
            drop(pin);
            match res {
                Err(MapError::DeviceBusy) if attempts < 2 => attempts += 1,
                other => return other,
            }
        }
    })
}

fn populate_window(ctx: &DeviceContext, obj: &Arc<BufferObject>, w: &Window) -> MapResult<()> {
    for i in 0..w.pages {
        let Some(host) = obj.page_phys(w.obj_base + i) else {
            return Err(MapError::DeviceBusy);
        };
        ctx.singleton.populate(w.user_start + (i << PAGE_SHIFT), host);
    }
    Ok(())
}
