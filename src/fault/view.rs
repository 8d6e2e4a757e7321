//! Partial-view selection under aperture pressure.

use crate::PAGE_SHIFT;
use crate::aperture::View;
use crate::object::BufferObject;

/// Smallest window carved out of the aperture: 1 MiB of pages.
pub const MIN_CHUNK_PAGES: u64 = (1 << 20) >> PAGE_SHIFT;

/// Window to bind when the full object does not fit: page-aligned, rounded
/// up to the object's tiling-row granularity, containing the faulting page
/// and never exceeding the object.
#[must_use]
pub fn compute_partial_view(obj: &BufferObject, page_offset: u64, mut chunk: u64) -> View {
    if let Some(tiling) = obj.tiling {
        chunk = chunk.next_multiple_of(tiling.row_pages.max(1));
    }

    let object_pages = obj.page_count();
    // A chunk covering the whole object is just the full view.
    if chunk >= object_pages {
        return View::full(object_pages);
    }

    let offset = (page_offset / chunk) * chunk;
    View {
        offset,
        pages: chunk.min(object_pages - offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use crate::object::ObjectDesc;
    use crate::object::pages::{MemClass, MemoryRegion};
    use std::sync::Arc;

    fn object(pages: u64, row_pages: Option<u64>) -> Arc<BufferObject> {
        let region = MemoryRegion::new(
            "vram",
            MemClass::Device,
            16 * 1024 * PAGE_SIZE,
            None,
            0,
        );
        let desc = ObjectDesc::new(1, pages * PAGE_SIZE, region);
        match row_pages {
            Some(rows) => desc.tiled(rows).build(),
            None => desc.build(),
        }
    }

    #[test]
    fn window_contains_the_faulting_page() {
        let obj = object(4096, Some(64));
        let view = compute_partial_view(&obj, 300, 256);
        assert_eq!(view.offset, 256);
        assert_eq!(view.pages, 256);
        assert!(view.contains(300));
    }

    #[test]
    fn chunk_rounds_up_to_tile_rows() {
        let obj = object(4096, Some(96));
        let view = compute_partial_view(&obj, 300, 256);
        // 256 rounded up to a 96-page row multiple is 288.
        assert_eq!(view.offset, 288);
        assert_eq!(view.pages, 288);
        assert!(view.contains(300));
        assert_eq!(view.offset % 96, 0);
    }

    #[test]
    fn tail_window_is_clipped_to_the_object() {
        let obj = object(300, None);
        let view = compute_partial_view(&obj, 299, 256);
        assert_eq!(view.offset, 256);
        assert_eq!(view.pages, 44);
    }

    #[test]
    fn small_objects_keep_the_full_view() {
        let obj = object(128, Some(64));
        let view = compute_partial_view(&obj, 100, 256);
        assert!(view.is_full(128));
    }
}
