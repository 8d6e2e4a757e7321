//! Mapping revocation.
//!
//! Removing a host mapping while the object is displaced, destroyed or the
//! device suspends forces the next access back through the fault path,
//! where placement is re-arbitrated. The aperture side settles userfault
//! bookkeeping under the aperture mutex; the offset side zaps every
//! non-Aperture view through the anonymous singleton.

use crate::PAGE_SHIFT;
use crate::device::context::DeviceContext;
use crate::mmap::MapKind;
use crate::object::BufferObject;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Eviction,
    Destruction,
    Suspend,
}

/// Invalidate every live mapping of the object. Idempotent: a second call
/// finds no userfault state and no populated entries.
pub fn release_all_mappings(ctx: &DeviceContext, obj: &Arc<BufferObject>, reason: ReleaseReason) {
    release_aperture_mappings(ctx, obj, reason);
    release_offset_mappings(ctx, obj);
}

fn release_aperture_mappings(ctx: &DeviceContext, obj: &Arc<BufferObject>, reason: ReleaseReason) {
    // Revoking entries requires the device awake.
    let _wakeref = ctx.power.wakeref();
    ctx.aperture.release_object(obj, &ctx.singleton);

    // Only this path may tear down the Aperture-kind record; the generic
    // registry teardown never touches it.
    if reason == ReleaseReason::Destruction {
        let record = obj.table.lock().unwrap().take(MapKind::Aperture);
        if let Some(record) = record {
            ctx.retire_record(&record);
        }
    }
}

fn release_offset_mappings(ctx: &DeviceContext, obj: &Arc<BufferObject>) {
    // A segment delegates to the parent's records, zapping only its own
    // window. A parent in teardown clears segment ranges itself.
    let (owner, window) = match &obj.segment {
        Some(link) => {
            let Some(parent) = link.parent.upgrade() else {
                return;
            };
            (parent, Some((link.offset >> PAGE_SHIFT, obj.page_count())))
        }
        None => (Arc::clone(obj), None),
    };

    let records: Vec<_> = {
        let table = owner.table.lock().unwrap();
        [MapKind::WriteCombined, MapKind::WriteBack, MapKind::Uncached]
            .into_iter()
            .filter_map(|kind| table.get(kind))
            .collect()
    };
    for record in records {
        let (first, pages) = window.unwrap_or((0, record.pages));
        ctx.singleton.zap_record_range(&record, first, pages);
    }
}

/// Generic registry teardown at destruction: retire every non-Aperture
/// record's offset region.
pub(crate) fn teardown_offset_records(ctx: &DeviceContext, obj: &BufferObject) {
    let records: Vec<_> = {
        let mut table = obj.table.lock().unwrap();
        [MapKind::WriteCombined, MapKind::WriteBack, MapKind::Uncached]
            .into_iter()
            .filter_map(|kind| table.take(kind))
            .collect()
    };
    for record in records {
        ctx.retire_record(&record);
    }
}
