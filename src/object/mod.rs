//! Buffer-object model.
//!
//! Objects are created and owned outside the fault core; the core borrows
//! them through `Arc` handles. An object carries its backing state, a
//! shared reservation lock, the per-object mapping table and the userfault
//! bookkeeping the revocation paths rely on.

pub mod pages;

use crate::PAGE_SHIFT;
use crate::mmap::registry::MappingTable;
use crate::txn::ResvLock;
use bitflags::bitflags;
use pages::{Madvise, MemoryRegion, MmState};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, Weak};

pub use pages::{MemClass, PagesPin, SgEntry};

pub type Handle = u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectFlags: u32 {
        const READ_ONLY = 1 << 0;
        /// Backing must be zero-filled before first host access.
        const CPU_CLEAR = 1 << 1;
        /// Offload to a host shadow regardless of budget pressure.
        const FORCE_OFFLOAD = 1 << 2;
        /// Object may never be mapped into a host process.
        const NEVER_MAP = 1 << 3;
        /// Host atomic accesses require system residency; migration on a
        /// direct fault is mandatory, not best effort.
        const HOST_ATOMICS = 1 << 4;
        /// Prefer system residency once a host fault touches the object.
        const SMEM_ON_FAULT = 1 << 5;
    }
}

/// Cache behavior of the object's backing relative to the aperture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    /// Not snooped; always coherent with aperture access.
    Uncached,
    /// CPU-snooped; incoherent through the aperture unless the device has a
    /// covering last-level cache.
    Snooped,
}

#[derive(Debug, Clone, Copy)]
pub struct Tiling {
    /// Pages per tile row; partial views are rounded to this granularity.
    pub row_pages: u64,
}

/// Non-owning link from a segment back to its parent.
#[derive(Debug, Clone)]
pub struct SegmentLink {
    pub parent: Weak<BufferObject>,
    /// Byte offset of this segment within the parent.
    pub offset: u64,
}

pub struct BufferObject {
    pub handle: Handle,
    /// Size in bytes, page aligned.
    pub size: u64,
    pub flags: ObjectFlags,
    pub cache: CacheLevel,
    pub tiling: Option<Tiling>,
    /// Shared with the object's shadow, so both are always locked together.
    pub resv: Arc<ResvLock>,
    pub(crate) mm: Mutex<MmState>,
    /// Count of live host mappings requiring revocation. Transitions happen
    /// only under the aperture mutex.
    pub(crate) userfault_count: AtomicU32,
    pub(crate) table: Mutex<MappingTable>,
    /// Independently resident sub-ranges; empty for plain objects. The
    /// parent owns the segments, segments link back without owning.
    pub segments: Vec<Arc<BufferObject>>,
    pub segment: Option<SegmentLink>,
}

impl BufferObject {
    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.size >> PAGE_SHIFT
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.flags.contains(ObjectFlags::READ_ONLY)
    }

    #[must_use]
    pub fn has_segments(&self) -> bool {
        !self.segments.is_empty()
    }

    #[must_use]
    pub fn is_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// Find the segment holding `byte_offset` and the offset within it.
    pub fn lookup_segment(&self, byte_offset: u64) -> Option<(Arc<BufferObject>, u64)> {
        for seg in &self.segments {
            let link = seg.segment.as_ref()?;
            if byte_offset >= link.offset && byte_offset < link.offset + seg.size {
                return Some((Arc::clone(seg), byte_offset - link.offset));
            }
        }
        None
    }

    pub fn madvise(&self) -> Madvise {
        self.mm.lock().unwrap().madv
    }

    pub fn set_madvise(&self, madv: Madvise) {
        self.mm.lock().unwrap().madv = madv;
    }

    pub fn shadow(&self) -> Option<Arc<BufferObject>> {
        self.mm.lock().unwrap().shadow.clone()
    }

    pub(crate) fn set_shadow(&self, shadow: Arc<BufferObject>) {
        self.mm.lock().unwrap().shadow = Some(shadow);
    }

    /// Drop the preferred-shadow designation; the next fault re-decides.
    pub fn clear_shadow(&self) {
        self.mm.lock().unwrap().shadow = None;
    }

    pub fn region(&self) -> Arc<MemoryRegion> {
        Arc::clone(&self.mm.lock().unwrap().region)
    }

    /// Live host mappings still requiring revocation.
    #[must_use]
    pub fn userfault_count(&self) -> u32 {
        self.userfault_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Construction parameters, consumed by `build`.
pub struct ObjectDesc {
    handle: Handle,
    size: u64,
    flags: ObjectFlags,
    cache: CacheLevel,
    tiling: Option<Tiling>,
    region: Arc<MemoryRegion>,
    share_resv: Option<Arc<ResvLock>>,
}

impl ObjectDesc {
    #[must_use]
    pub fn new(handle: Handle, size: u64, region: Arc<MemoryRegion>) -> Self {
        Self {
            handle,
            size: size.next_multiple_of(crate::PAGE_SIZE),
            flags: ObjectFlags::empty(),
            cache: CacheLevel::Uncached,
            tiling: None,
            region,
            share_resv: None,
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: ObjectFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.flags |= ObjectFlags::READ_ONLY;
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheLevel) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn tiled(mut self, row_pages: u64) -> Self {
        self.tiling = Some(Tiling { row_pages });
        self
    }

    /// Join an existing synchronization domain (shadow objects share the
    /// real object's reservation).
    #[must_use]
    pub fn share_resv(mut self, resv: Arc<ResvLock>) -> Self {
        self.share_resv = Some(resv);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<BufferObject> {
        let resv = self.share_resv.unwrap_or_else(ResvLock::new);
        Arc::new(BufferObject {
            handle: self.handle,
            size: self.size,
            flags: self.flags,
            cache: self.cache,
            tiling: self.tiling,
            resv,
            mm: Mutex::new(MmState::new(self.region)),
            userfault_count: AtomicU32::new(0),
            table: Mutex::new(MappingTable::default()),
            segments: Vec::new(),
            segment: None,
        })
    }

    /// Build a parent object owning one segment per entry in
    /// `segment_layout`, each `(byte_offset, byte_size)` within the parent.
    /// Ranges not covered by any segment have no backing and fault fatally.
    #[must_use]
    pub fn build_segmented(self, segment_layout: &[(u64, u64)]) -> Arc<BufferObject> {
        let resv = self.share_resv.unwrap_or_else(ResvLock::new);
        let handle = self.handle;
        let region = Arc::clone(&self.region);
        Arc::new_cyclic(|parent: &Weak<BufferObject>| {
            let segments = segment_layout
                .iter()
                .map(|&(offset, size)| {
                    Arc::new(BufferObject {
                        handle,
                        size: size.next_multiple_of(crate::PAGE_SIZE),
                        flags: self.flags,
                        cache: self.cache,
                        tiling: None,
                        resv: ResvLock::new(),
                        mm: Mutex::new(MmState::new(Arc::clone(&region))),
                        userfault_count: AtomicU32::new(0),
                        table: Mutex::new(MappingTable::default()),
                        segments: Vec::new(),
                        segment: Some(SegmentLink {
                            parent: parent.clone(),
                            offset,
                        }),
                    })
                })
                .collect();
            BufferObject {
                handle,
                size: self.size,
                flags: self.flags,
                cache: self.cache,
                tiling: self.tiling,
                resv,
                mm: Mutex::new(MmState::new(region)),
                userfault_count: AtomicU32::new(0),
                table: Mutex::new(MappingTable::default()),
                segments,
                segment: None,
            }
        })
    }
}
