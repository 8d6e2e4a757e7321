//! Mapping-offset registry.
//!
//! Every (object, kind) pair owns at most one record, carved out of a
//! single offset space shared by all objects. The per-object table and the
//! global allocator use separate locks; concurrent creators race and the
//! loser discards its freshly allocated region and adopts the winner.

use super::MapKind;
use crate::PAGE_SHIFT;
use crate::device::context::DeviceContext;
use crate::error::{MapError, MapResult};
use crate::object::BufferObject;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

/// Identity of a mapping requester (client file handle analog).
pub type RequesterId = u64;

pub struct MappingRecord {
    pub kind: MapKind,
    /// First page in the global mapping-offset space.
    pub offset: u64,
    pub pages: u64,
    pub object: Weak<BufferObject>,
    allow: Mutex<HashSet<RequesterId>>,
}

impl MappingRecord {
    /// Permit `requester` to map through this record. Idempotent.
    pub fn allow(&self, requester: RequesterId) {
        self.allow.lock().unwrap().insert(requester);
    }

    #[must_use]
    pub fn is_allowed(&self, requester: RequesterId) -> bool {
        self.allow.lock().unwrap().contains(&requester)
    }

    #[must_use]
    pub fn offset_bytes(&self) -> u64 {
        self.offset << PAGE_SHIFT
    }
}

/// Per-object record table, one slot per kind. The kind set is small and
/// fixed, so a flat array replaces any ordered structure.
pub struct MappingTable {
    slots: [Option<Arc<MappingRecord>>; MapKind::COUNT],
}

impl Default for MappingTable {
    fn default() -> Self {
        Self {
            slots: [None, None, None, None],
        }
    }
}

impl MappingTable {
    pub(crate) fn get(&self, kind: MapKind) -> Option<Arc<MappingRecord>> {
        self.slots[kind.index()].clone()
    }

    pub(crate) fn insert(&mut self, record: Arc<MappingRecord>) {
        let index = record.kind.index();
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(record);
    }

    pub(crate) fn take(&mut self, kind: MapKind) -> Option<Arc<MappingRecord>> {
        self.slots[kind.index()].take()
    }
}

/// Global offset space plus the offset → record index used to resolve map
/// requests. One lock covers both.
pub(crate) struct OffsetManager {
    space: OffsetSpace,
    nodes: BTreeMap<u64, Weak<MappingRecord>>,
}

impl OffsetManager {
    pub fn new(pages: u64) -> Self {
        Self {
            space: OffsetSpace::new(pages),
            nodes: BTreeMap::new(),
        }
    }

    pub fn allocate(&mut self, pages: u64) -> Option<u64> {
        self.space.allocate(pages)
    }

    pub fn release(&mut self, start: u64, pages: u64) {
        self.nodes.remove(&start);
        self.space.release(start, pages);
    }

    pub fn register(&mut self, record: &Arc<MappingRecord>) {
        self.nodes.insert(record.offset, Arc::downgrade(record));
    }

    pub fn unregister(&mut self, offset: u64) {
        self.nodes.remove(&offset);
    }

    pub fn lookup(&self, page_offset: u64) -> Option<Arc<MappingRecord>> {
        self.nodes.get(&page_offset).and_then(Weak::upgrade)
    }
}

/// Hole-searching allocator over the shared offset space.
struct OffsetSpace {
    limit: u64,
    // Occupied ranges, start page -> page count.
    allocations: BTreeMap<u64, u64>,
}

impl OffsetSpace {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            allocations: BTreeMap::new(),
        }
    }

    fn allocate(&mut self, pages: u64) -> Option<u64> {
        let mut candidate = 0;

        // Walk existing allocations looking for a hole.
        for (&start, &len) in &self.allocations {
            if start > candidate && start - candidate >= pages {
                self.allocations.insert(candidate, pages);
                return Some(candidate);
            }
            candidate = candidate.max(start + len);
        }

        if candidate + pages <= self.limit {
            self.allocations.insert(candidate, pages);
            return Some(candidate);
        }

        None // Out of offset space
    }

    fn release(&mut self, start: u64, _pages: u64) {
        if self.allocations.remove(&start).is_none() {
            log::error!("released untracked offset region at page {start}");
        }
    }
}

/// Look up or create the mapping record for (object, kind).
///
/// # Errors
/// `ResourceExhausted` when the offset space stays full even after forcing
/// dead-object reclamation.
pub fn get_or_create(
    ctx: &DeviceContext,
    obj: &Arc<BufferObject>,
    kind: MapKind,
    requester: RequesterId,
) -> MapResult<Arc<MappingRecord>> {
    if let Some(record) = obj.table.lock().unwrap().get(kind) {
        record.allow(requester);
        return Ok(record);
    }

    let pages = obj.page_count().max(1);
    let offset = match ctx.allocate_offsets(pages) {
        Some(offset) => offset,
        None => {
            // Reap offset space from objects pending destruction, then
            // retry exactly once.
            ctx.reclaim_dead_offsets();
            ctx.allocate_offsets(pages)
                .ok_or(MapError::ResourceExhausted)?
        }
    };

    let record = Arc::new(MappingRecord {
        kind,
        offset,
        pages,
        object: Arc::downgrade(obj),
        allow: Mutex::new(HashSet::new()),
    });
    ctx.register_node(&record);

    let mut table = obj.table.lock().unwrap();
    if let Some(winner) = table.get(kind) {
        // Lost the creation race: discard our region, adopt the winner.
        drop(table);
        ctx.release_offsets(offset, pages);
        winner.allow(requester);
        return Ok(winner);
    }
    table.insert(Arc::clone(&record));
    drop(table);

    record.allow(requester);
    Ok(record)
}
