//! Anonymous-mapping singleton.
//!
//! One shared mapping identity per device context: client views are carved
//! out of a single reserved host address range, so mapping lifetime is
//! decoupled from any individual client file handle and revocation can
//! enumerate every view in one place. The range is reserved `PROT_NONE` —
//! nothing is ever accessed through it directly; population lives in the
//! page-table entry model.

use super::registry::{MappingRecord, RequesterId};
use crate::PAGE_SHIFT;
use crate::error::{MapError, MapResult};
use crate::object::BufferObject;
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

/// An established client view of a mapping record.
pub struct VmArea {
    pub start: u64,
    pub pages: u64,
    /// Object page corresponding to `start`.
    pub first_page: u64,
    pub kind: super::MapKind,
    pub writable: bool,
    /// The view keeps the object alive for its whole lifetime.
    pub object: Arc<BufferObject>,
    pub record: Arc<MappingRecord>,
}

impl VmArea {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + (self.pages << PAGE_SHIFT)
    }
}

pub struct MmapSingleton {
    arena_base: u64,
    arena_len: usize,
    areas: Mutex<BTreeMap<u64, Arc<VmArea>>>,
    /// Populated page-table entries: user page address → host address.
    ptes: Mutex<BTreeMap<u64, u64>>,
}

impl MmapSingleton {
    /// Reserve the shared host address range. Sized to the whole offset
    /// space so every record has a fixed slot in it.
    pub(crate) fn attach(offset_space_pages: u64) -> io::Result<Self> {
        let len = (offset_space_pages << PAGE_SHIFT) as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            arena_base: ptr as u64,
            arena_len: len,
            areas: Mutex::new(BTreeMap::new()),
            ptes: Mutex::new(BTreeMap::new()),
        })
    }

    /// Establish a view of `[first_page, first_page + pages)` of the
    /// record. Re-mapping an identical window returns the shared view.
    ///
    /// # Errors
    /// `AccessDenied` for requesters missing from the allow-list and for
    /// writable views of read-only objects; `Unsupported` for windows
    /// exceeding the record.
    pub(crate) fn map_record(
        &self,
        record: &Arc<MappingRecord>,
        first_page: u64,
        pages: u64,
        writable: bool,
        requester: RequesterId,
    ) -> MapResult<Arc<VmArea>> {
        let Some(object) = record.object.upgrade() else {
            // Owner already in teardown.
            return Err(MapError::NotFound);
        };
        if !record.is_allowed(requester) {
            return Err(MapError::AccessDenied);
        }
        if writable && object.is_readonly() {
            return Err(MapError::AccessDenied);
        }
        if first_page + pages > record.pages || pages == 0 {
            return Err(MapError::Unsupported);
        }

        let start = self.arena_base + ((record.offset + first_page) << PAGE_SHIFT);
        let mut areas = self.areas.lock().unwrap();
        if let Some(existing) = areas.get(&start) {
            if existing.pages == pages && Arc::ptr_eq(&existing.record, record) {
                return Ok(Arc::clone(existing));
            }
        }
        let area = Arc::new(VmArea {
            start,
            pages,
            first_page,
            kind: record.kind,
            writable,
            object,
            record: Arc::clone(record),
        });
        areas.insert(start, Arc::clone(&area));
        Ok(area)
    }

    pub fn lookup(&self, addr: u64) -> Option<Arc<VmArea>> {
        let areas = self.areas.lock().unwrap();
        areas
            .range(..=addr)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(addr))
            .cloned()
    }

    pub(crate) fn populate_range(&self, user_start: u64, host_start: u64, pages: u64) {
        let mut ptes = self.ptes.lock().unwrap();
        for i in 0..pages {
            ptes.insert(user_start + (i << PAGE_SHIFT), host_start + (i << PAGE_SHIFT));
        }
    }

    pub(crate) fn populate(&self, user_page_addr: u64, host_addr: u64) {
        self.ptes.lock().unwrap().insert(user_page_addr, host_addr);
    }

    /// Host address a populated user page resolves to.
    #[must_use]
    pub fn entry(&self, addr: u64) -> Option<u64> {
        let page = addr & !((1u64 << PAGE_SHIFT) - 1);
        self.ptes.lock().unwrap().get(&page).copied()
    }

    /// Number of populated entries inside `[start, start + pages)`.
    #[must_use]
    pub fn populated(&self, start: u64, pages: u64) -> usize {
        let end = start + (pages << PAGE_SHIFT);
        self.ptes.lock().unwrap().range(start..end).count()
    }

    pub(crate) fn zap_range(&self, start: u64, pages: u64) {
        let end = start + (pages << PAGE_SHIFT);
        let mut ptes = self.ptes.lock().unwrap();
        let stale: Vec<u64> = ptes.range(start..end).map(|(addr, _)| *addr).collect();
        for addr in stale {
            ptes.remove(&addr);
        }
    }

    /// Zap the object window `[first_page, first_page + pages)` across
    /// every view of `record`.
    pub(crate) fn zap_record_range(
        &self,
        record: &Arc<MappingRecord>,
        first_page: u64,
        pages: u64,
    ) {
        let views: Vec<Arc<VmArea>> = self
            .areas
            .lock()
            .unwrap()
            .values()
            .filter(|area| Arc::ptr_eq(&area.record, record))
            .cloned()
            .collect();
        for area in views {
            let lo = first_page.max(area.first_page);
            let hi = (first_page + pages).min(area.first_page + area.pages);
            if lo < hi {
                self.zap_range(area.start + ((lo - area.first_page) << PAGE_SHIFT), hi - lo);
            }
        }
    }
}

impl Drop for MmapSingleton {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.arena_base as *mut libc::c_void, self.arena_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn populate_lookup_zap_roundtrip() {
        let singleton = MmapSingleton::attach(64).unwrap();
        let base = singleton.arena_base;

        singleton.populate_range(base, 0x9000_0000, 4);
        assert_eq!(singleton.populated(base, 4), 4);
        assert_eq!(singleton.entry(base + PAGE_SIZE + 12), Some(0x9000_0000 + PAGE_SIZE));

        singleton.zap_range(base + PAGE_SIZE, 2);
        assert_eq!(singleton.populated(base, 4), 2);
        assert_eq!(singleton.entry(base + PAGE_SIZE), None);
        assert_eq!(singleton.entry(base + 3 * PAGE_SIZE), Some(0x9000_0000 + 3 * PAGE_SIZE));
    }
}
