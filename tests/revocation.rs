//! Revocation scenarios: userfault bookkeeping, destruction, suspend and
//! fence-contention displacement.

use gmm_rs::device::context::{DeviceConfig, DeviceContext};
use gmm_rs::fault::{FaultOutcome, handle_fault};
use gmm_rs::mmap::{self, MAP_OFFSET_APERTURE, MAP_OFFSET_WB, OffsetRequest, VmArea};
use gmm_rs::object::ObjectDesc;
use gmm_rs::revoke::{ReleaseReason, release_all_mappings};
use gmm_rs::{MapError, PAGE_SIZE};
use std::sync::Arc;

fn map_kind(ctx: &DeviceContext, handle: u64, flags: u32, requester: u64) -> Arc<VmArea> {
    let req = OffsetRequest {
        handle,
        flags,
        ..OffsetRequest::default()
    };
    let offset = mmap::mapping_offset(ctx, &req, requester).unwrap();
    mmap::map_view(ctx, offset, true, requester).unwrap()
}

#[test]
fn release_drains_userfault_count_and_is_idempotent() {
    // An aperture small enough that each fault binds its own partial view.
    let config = DeviceConfig {
        aperture_pages: 512,
        ..DeviceConfig::default()
    };
    let ctx = DeviceContext::attach(config).unwrap();
    let obj = ObjectDesc::new(1, 4096 * PAGE_SIZE, Arc::clone(&ctx.device_region)).build();
    ctx.insert_object(Arc::clone(&obj));
    let area = map_kind(&ctx, 1, MAP_OFFSET_APERTURE, 1);

    assert_eq!(handle_fault(&ctx, area.start, false), FaultOutcome::Done);
    assert_eq!(
        handle_fault(&ctx, area.start + 2048 * PAGE_SIZE, false),
        FaultOutcome::Done
    );
    assert_eq!(obj.userfault_count(), 2);
    assert!(ctx.aperture.on_revocation_list(&obj));

    release_all_mappings(&ctx, &obj, ReleaseReason::Eviction);
    assert_eq!(obj.userfault_count(), 0);
    assert!(!ctx.aperture.on_revocation_list(&obj));
    assert_eq!(ctx.singleton.populated(area.start, 4096), 0);

    // A second release finds nothing to undo.
    release_all_mappings(&ctx, &obj, ReleaseReason::Eviction);
    assert_eq!(obj.userfault_count(), 0);

    // The mapping is re-established by the next fault.
    assert_eq!(handle_fault(&ctx, area.start, false), FaultOutcome::Done);
    assert_eq!(obj.userfault_count(), 1);
}

#[test]
fn destruction_revokes_and_poisons_later_faults() {
    let ctx = DeviceContext::attach(DeviceConfig::default()).unwrap();
    let obj = ObjectDesc::new(1, 4 * PAGE_SIZE, Arc::clone(&ctx.system_region)).build();
    ctx.insert_object(Arc::clone(&obj));
    let area = map_kind(&ctx, 1, MAP_OFFSET_WB, 1);

    assert_eq!(handle_fault(&ctx, area.start, true), FaultOutcome::Done);
    assert_eq!(ctx.singleton.populated(area.start, 4), 4);

    ctx.destroy_object(1);
    assert_eq!(ctx.singleton.populated(area.start, 4), 0);

    // The view still exists; accesses through it now die synchronously.
    assert_eq!(handle_fault(&ctx, area.start, false), FaultOutcome::BusError);
    assert!(matches!(ctx.lookup_object(1), Err(MapError::NotFound)));
}

#[test]
fn suspend_drains_the_revocation_list() {
    let ctx = DeviceContext::attach(DeviceConfig::default()).unwrap();
    let obj = ObjectDesc::new(1, 16 * PAGE_SIZE, Arc::clone(&ctx.device_region)).build();
    ctx.insert_object(Arc::clone(&obj));
    let area = map_kind(&ctx, 1, MAP_OFFSET_APERTURE, 1);

    assert_eq!(handle_fault(&ctx, area.start, true), FaultOutcome::Done);
    assert_eq!(obj.userfault_count(), 1);

    ctx.suspend();
    assert_eq!(obj.userfault_count(), 0);
    assert!(!ctx.aperture.on_revocation_list(&obj));
    assert_eq!(ctx.singleton.populated(area.start, 16), 0);

    // After resume the next access faults the mapping back in.
    ctx.resume();
    assert_eq!(handle_fault(&ctx, area.start, false), FaultOutcome::Done);
    assert_eq!(obj.userfault_count(), 1);
}

#[test]
fn fence_contention_displaces_the_previous_user() {
    let config = DeviceConfig {
        fence_count: 1,
        ..DeviceConfig::default()
    };
    let ctx = DeviceContext::attach(config).unwrap();
    let a = ObjectDesc::new(1, 8 * PAGE_SIZE, Arc::clone(&ctx.device_region))
        .tiled(2)
        .build();
    let b = ObjectDesc::new(2, 8 * PAGE_SIZE, Arc::clone(&ctx.device_region))
        .tiled(2)
        .build();
    ctx.insert_object(Arc::clone(&a));
    ctx.insert_object(Arc::clone(&b));

    let area_a = map_kind(&ctx, 1, MAP_OFFSET_APERTURE, 1);
    let area_b = map_kind(&ctx, 2, MAP_OFFSET_APERTURE, 1);

    assert_eq!(handle_fault(&ctx, area_a.start, true), FaultOutcome::Done);
    assert_eq!(ctx.singleton.populated(area_a.start, 8), 8);
    assert_eq!(ctx.aperture.fences_in_use(), 1);

    // The second tiled object steals the only fence; the first loses its
    // mapping and will refault.
    assert_eq!(handle_fault(&ctx, area_b.start, true), FaultOutcome::Done);
    assert_eq!(ctx.singleton.populated(area_b.start, 8), 8);
    assert_eq!(ctx.singleton.populated(area_a.start, 8), 0);
    assert_eq!(a.userfault_count(), 0);
    assert_eq!(b.userfault_count(), 1);
    assert_eq!(ctx.aperture.fences_in_use(), 1);

    assert_eq!(handle_fault(&ctx, area_a.start, true), FaultOutcome::Done);
    assert_eq!(ctx.singleton.populated(area_b.start, 8), 0);
}
