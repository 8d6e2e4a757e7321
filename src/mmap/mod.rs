//! Mapping boundary operations: offset requests, view establishment and
//! the legacy whole-object map.

pub mod registry;
pub mod singleton;

use crate::PAGE_SHIFT;
use crate::device::context::{DeviceCaps, DeviceContext};
use crate::error::{MapError, MapResult};
use crate::object::{BufferObject, Handle, ObjectFlags};
use std::sync::Arc;

pub use registry::{MappingRecord, MappingTable, RequesterId};
pub use singleton::{MmapSingleton, VmArea};

/// Mapping kinds. A record's kind is immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    /// Bound through the device aperture; tiling-aware, fence-arbitrated.
    Aperture,
    WriteCombined,
    WriteBack,
    Uncached,
}

impl MapKind {
    pub const COUNT: usize = 4;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

pub const MAP_OFFSET_APERTURE: u32 = 0;
pub const MAP_OFFSET_WC: u32 = 1;
pub const MAP_OFFSET_WB: u32 = 2;
pub const MAP_OFFSET_UC: u32 = 3;

/// Raw mapping-offset request. The layout is ABI-frozen.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetRequest {
    pub handle: Handle,
    pub flags: u32,
    /// Historically never validated; old clients feed garbage here and the
    /// ABI is frozen, so rejecting it is forbidden.
    pub pad: u32,
    /// Same historical status as `pad`.
    pub offset: u64,
    pub extensions: u64,
}

/// Resolve an offset request to a mapping offset in bytes.
///
/// # Errors
/// `Unsupported` for unknown flags, kinds the device cannot serve, or a
/// non-empty extension chain; `NotFound` for a stale handle;
/// `ResourceExhausted` when the offset space is full.
pub fn mapping_offset(
    ctx: &DeviceContext,
    req: &OffsetRequest,
    requester: RequesterId,
) -> MapResult<u64> {
    // Extension chains are recognized but none are defined.
    if req.extensions != 0 {
        return Err(MapError::Unsupported);
    }

    let kind = match req.flags {
        MAP_OFFSET_APERTURE => {
            if !ctx.caps.has_aperture {
                return Err(MapError::Unsupported);
            }
            MapKind::Aperture
        }
        MAP_OFFSET_WC => {
            if !ctx.caps.pat {
                return Err(MapError::Unsupported);
            }
            MapKind::WriteCombined
        }
        MAP_OFFSET_WB => MapKind::WriteBack,
        MAP_OFFSET_UC => {
            if !ctx.caps.pat {
                return Err(MapError::Unsupported);
            }
            MapKind::Uncached
        }
        _ => return Err(MapError::Unsupported),
    };

    let obj = ctx.lookup_object(req.handle)?;
    Ok(attach_record(ctx, &obj, kind, requester)?.offset_bytes())
}

/// Default mapping kind for simple clients that do not pick one.
pub fn default_map_kind(caps: &DeviceCaps) -> MapResult<MapKind> {
    if caps.pat {
        Ok(MapKind::WriteCombined)
    } else if caps.has_aperture {
        Ok(MapKind::Aperture)
    } else {
        Err(MapError::Unsupported)
    }
}

/// Offset request with the device-chosen default kind.
pub fn dumb_mapping_offset(
    ctx: &DeviceContext,
    handle: Handle,
    requester: RequesterId,
) -> MapResult<u64> {
    let kind = default_map_kind(&ctx.caps)?;
    let obj = ctx.lookup_object(handle)?;
    Ok(attach_record(ctx, &obj, kind, requester)?.offset_bytes())
}

fn attach_record(
    ctx: &DeviceContext,
    obj: &Arc<BufferObject>,
    kind: MapKind,
    requester: RequesterId,
) -> MapResult<Arc<MappingRecord>> {
    if obj.flags.contains(ObjectFlags::NEVER_MAP) {
        return Err(MapError::Unsupported);
    }
    // Direct kinds need host-visible pages or an I/O window to populate
    // from; the aperture path brings its own.
    if kind != MapKind::Aperture {
        let region = obj.region();
        if !region.has_host_pages() && region.io_base.is_none() {
            return Err(MapError::Unsupported);
        }
    }
    registry::get_or_create(ctx, obj, kind, requester)
}

/// Establish a view covering the whole record behind `offset`.
///
/// # Errors
/// `NotFound` for unknown offsets, `AccessDenied` for requesters missing
/// from the record's allow-list.
pub fn map_view(
    ctx: &DeviceContext,
    offset: u64,
    writable: bool,
    requester: RequesterId,
) -> MapResult<Arc<VmArea>> {
    let record = ctx
        .lookup_node(offset >> PAGE_SHIFT)
        .ok_or(MapError::NotFound)?;
    ctx.singleton
        .map_record(&record, 0, record.pages, writable, requester)
}

/// Legacy whole-call map: pick the kind from the write-combined flag,
/// validate the range against the object and establish the view at once.
/// Returns the view's start address.
pub fn map_legacy(
    ctx: &DeviceContext,
    handle: Handle,
    offset: u64,
    size: u64,
    write_combined: bool,
    requester: RequesterId,
) -> MapResult<u64> {
    if write_combined && !ctx.caps.pat {
        return Err(MapError::Unsupported);
    }
    let obj = ctx.lookup_object(handle)?;
    let overflows = offset
        .checked_add(size)
        .is_none_or(|end| end > obj.size);
    if overflows || size == 0 {
        return Err(MapError::Unsupported);
    }

    let kind = if write_combined {
        MapKind::WriteCombined
    } else {
        MapKind::WriteBack
    };
    let record = attach_record(ctx, &obj, kind, requester)?;
    let area = ctx.singleton.map_record(
        &record,
        offset >> PAGE_SHIFT,
        size.div_ceil(crate::PAGE_SIZE),
        !obj.is_readonly(),
        requester,
    )?;
    Ok(area.start + (offset & (crate::PAGE_SIZE - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use crate::device::context::{DeviceConfig, DeviceContext};
    use crate::object::ObjectDesc;

    fn ctx() -> Arc<DeviceContext> {
        DeviceContext::attach(DeviceConfig::default()).unwrap()
    }

    #[test]
    fn unvalidated_fields_stay_unvalidated() {
        let ctx = ctx();
        let obj = ObjectDesc::new(7, 2 * PAGE_SIZE, Arc::clone(&ctx.system_region)).build();
        ctx.insert_object(obj);

        // Garbage in pad/offset must not be rejected; the ABI is frozen.
        let req = OffsetRequest {
            handle: 7,
            flags: MAP_OFFSET_WB,
            pad: 0xdead_beef,
            offset: u64::MAX,
            extensions: 0,
        };
        mapping_offset(&ctx, &req, 1).unwrap();

        // A non-empty extension chain is another matter.
        let req = OffsetRequest {
            extensions: 0x1000,
            ..req
        };
        assert!(matches!(
            mapping_offset(&ctx, &req, 1),
            Err(MapError::Unsupported)
        ));
    }

    #[test]
    fn kind_flags_respect_device_caps() {
        let mut config = DeviceConfig::default();
        config.caps.pat = false;
        let ctx = DeviceContext::attach(config).unwrap();
        let obj = ObjectDesc::new(1, PAGE_SIZE, Arc::clone(&ctx.system_region)).build();
        ctx.insert_object(obj);

        let wc = OffsetRequest {
            handle: 1,
            flags: MAP_OFFSET_WC,
            ..OffsetRequest::default()
        };
        assert!(matches!(
            mapping_offset(&ctx, &wc, 1),
            Err(MapError::Unsupported)
        ));

        // Without PAT the default kind falls back to the aperture.
        assert_eq!(default_map_kind(&ctx.caps).unwrap(), MapKind::Aperture);
    }

    #[test]
    fn map_view_enforces_the_allow_list() {
        let ctx = ctx();
        let obj = ObjectDesc::new(3, 2 * PAGE_SIZE, Arc::clone(&ctx.system_region)).build();
        ctx.insert_object(obj);

        let req = OffsetRequest {
            handle: 3,
            flags: MAP_OFFSET_WB,
            ..OffsetRequest::default()
        };
        let offset = mapping_offset(&ctx, &req, 42).unwrap();

        assert!(matches!(
            map_view(&ctx, offset, true, 99),
            Err(MapError::AccessDenied)
        ));
        // Additions are idempotent; a second request re-allows the same id.
        mapping_offset(&ctx, &req, 42).unwrap();
        let area = map_view(&ctx, offset, true, 42).unwrap();
        assert_eq!(area.pages, 2);
    }

    #[test]
    fn legacy_map_validates_the_range() {
        let ctx = ctx();
        let obj = ObjectDesc::new(4, 4 * PAGE_SIZE, Arc::clone(&ctx.system_region)).build();
        ctx.insert_object(obj);

        assert!(matches!(
            map_legacy(&ctx, 4, 2 * PAGE_SIZE, 3 * PAGE_SIZE, false, 1),
            Err(MapError::Unsupported)
        ));
        let addr = map_legacy(&ctx, 4, PAGE_SIZE, 2 * PAGE_SIZE, false, 1).unwrap();
        assert!(ctx.singleton.lookup(addr).is_some());
    }
}
