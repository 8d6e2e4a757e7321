//! Backing-store state: regions, resident page lists, pinning and
//! migration. Physical placement policy lives outside the fault core; these
//! operations are consumed by it as already-correct primitives.

use super::{BufferObject, ObjectFlags};
use crate::PAGE_SHIFT;
use crate::error::{MapError, MapResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemClass {
    /// Host-visible pages; scatter-gather entries are host addresses.
    System,
    /// Device-local; host access goes through a fixed I/O window.
    Device,
}

/// A memory region objects draw backing from. `avail` is the free budget
/// the swap policy consults.
#[derive(Debug)]
pub struct MemoryRegion {
    pub name: &'static str,
    pub class: MemClass,
    total: u64,
    avail: AtomicU64,
    /// Host window base for device-local regions; `None` means pages are
    /// host-visible as-is.
    pub io_base: Option<u64>,
    start: u64,
    cursor: AtomicU64,
}

impl MemoryRegion {
    #[must_use]
    pub fn new(
        name: &'static str,
        class: MemClass,
        total: u64,
        io_base: Option<u64>,
        start: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            class,
            total,
            avail: AtomicU64::new(total),
            io_base,
            start,
            cursor: AtomicU64::new(start),
        })
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn avail(&self) -> u64 {
        self.avail.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn has_host_pages(&self) -> bool {
        matches!(self.class, MemClass::System)
    }

    /// Host-visible address for a device address in this region.
    pub(crate) fn host_addr(&self, dma: u64) -> u64 {
        match self.io_base {
            Some(base) => base + (dma - self.start),
            None => dma,
        }
    }

    pub(crate) fn take(&self, bytes: u64) -> Option<u64> {
        let mut cur = self.avail.load(Ordering::Relaxed);
        loop {
            if cur < bytes {
                return None;
            }
            match self.avail.compare_exchange_weak(
                cur,
                cur - bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
        Some(self.cursor.fetch_add(bytes, Ordering::Relaxed))
    }

    pub(crate) fn put(&self, bytes: u64) {
        self.avail.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct SgEntry {
    pub dma: u64,
    pub len: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Pages {
    pub sg: Vec<SgEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Madvise {
    WillNeed,
    DontNeed,
    Purged,
}

pub(crate) struct MmState {
    pub region: Arc<MemoryRegion>,
    pub pages: Option<Pages>,
    pub pin_count: u32,
    pub madv: Madvise,
    pub shadow: Option<Arc<BufferObject>>,
    pub vmap: Option<Vec<u8>>,
}

impl MmState {
    pub fn new(region: Arc<MemoryRegion>) -> Self {
        Self {
            region,
            pages: None,
            pin_count: 0,
            madv: Madvise::WillNeed,
            shadow: None,
            vmap: None,
        }
    }
}

/// Pin on an object's resident pages; released on drop. Page-table entries
/// populated while pinned stay valid after release.
pub struct PagesPin {
    obj: Arc<BufferObject>,
}

impl Drop for PagesPin {
    fn drop(&mut self) {
        self.obj.unpin_pages();
    }
}

impl BufferObject {
    /// Make the object's pages resident and pin them.
    ///
    /// # Errors
    /// `FatalAccess` for purged objects or objects that cannot fit their
    /// backing region; `ResourceExhausted` when the region budget is spent.
    pub fn pin_pages_sync(self: &Arc<Self>) -> MapResult<PagesPin> {
        let mut mm = self.mm.lock().unwrap();
        if mm.madv == Madvise::Purged {
            return Err(MapError::FatalAccess);
        }
        if mm.pages.is_none() {
            if self.size > mm.region.total() {
                return Err(MapError::FatalAccess);
            }
            let Some(base) = mm.region.take(self.size) else {
                return Err(MapError::ResourceExhausted);
            };
            mm.pages = Some(Pages {
                sg: vec![SgEntry {
                    dma: base,
                    len: self.size,
                }],
            });
            if self.flags.contains(ObjectFlags::CPU_CLEAR) {
                if let Some(vmap) = mm.vmap.as_mut() {
                    vmap.fill(0);
                }
            }
        }
        mm.pin_count += 1;
        Ok(PagesPin {
            obj: Arc::clone(self),
        })
    }

    pub(crate) fn unpin_pages(&self) {
        let mut mm = self.mm.lock().unwrap();
        debug_assert!(mm.pin_count > 0);
        mm.pin_count -= 1;
    }

    pub fn has_pages(&self) -> bool {
        self.mm.lock().unwrap().pages.is_some()
    }

    pub fn has_pinned_pages(&self) -> bool {
        self.mm.lock().unwrap().pin_count > 0
    }

    /// Host-visible address of the given object page, from the resident
    /// scatter-gather list (device-local regions translate through their
    /// I/O window).
    pub(crate) fn page_phys(&self, page: u64) -> Option<u64> {
        let mm = self.mm.lock().unwrap();
        let pages = mm.pages.as_ref()?;
        let mut rem = page << PAGE_SHIFT;
        for entry in &pages.sg {
            if rem < entry.len {
                return Some(mm.region.host_addr(entry.dma + rem));
            }
            rem -= entry.len;
        }
        None
    }

    /// Move backing to the system region. Fails `DeviceBusy` while pages
    /// are pinned; a no-op when already system resident.
    pub(crate) fn migrate_to_system(&self, system: &Arc<MemoryRegion>) -> MapResult<()> {
        let mut mm = self.mm.lock().unwrap();
        if mm.region.has_host_pages() {
            return Ok(());
        }
        if mm.pin_count > 0 {
            return Err(MapError::DeviceBusy);
        }
        if let Some(pages) = mm.pages.take() {
            let bytes: u64 = pages.sg.iter().map(|e| e.len).sum();
            let Some(base) = system.take(bytes) else {
                mm.pages = Some(pages);
                return Err(MapError::ResourceExhausted);
            };
            mm.region.put(bytes);
            mm.pages = Some(Pages {
                sg: vec![SgEntry { dma: base, len: bytes }],
            });
        }
        mm.region = Arc::clone(system);
        Ok(())
    }

    /// Debug map of the object contents, independent of any established
    /// user mapping.
    pub(crate) fn with_vmap<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut mm = self.mm.lock().unwrap();
        let len = self.size as usize;
        let vmap = mm.vmap.get_or_insert_with(|| vec![0; len]);
        f(vmap.as_mut_slice())
    }

    /// Destruction: return backing to its region and poison further
    /// faults.
    pub(crate) fn release_backing(&self) {
        let mut mm = self.mm.lock().unwrap();
        if let Some(pages) = mm.pages.take() {
            let bytes: u64 = pages.sg.iter().map(|e| e.len).sum();
            mm.region.put(bytes);
        }
        mm.vmap = None;
        mm.shadow = None;
        mm.madv = Madvise::Purged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use crate::object::ObjectDesc;

    #[test]
    fn pin_accounts_against_region_budget() {
        let region = MemoryRegion::new("vram", MemClass::Device, 4 * PAGE_SIZE, Some(0x1000_0000), 0);
        let obj = ObjectDesc::new(1, 2 * PAGE_SIZE, Arc::clone(&region)).build();

        let pin = obj.pin_pages_sync().unwrap();
        assert_eq!(region.avail(), 2 * PAGE_SIZE);
        assert_eq!(obj.page_phys(1), Some(0x1000_0000 + PAGE_SIZE));
        drop(pin);
        assert!(!obj.has_pinned_pages());
        // Residency survives the unpin.
        assert!(obj.has_pages());
    }

    #[test]
    fn pin_fails_when_region_is_spent() {
        let region = MemoryRegion::new("vram", MemClass::Device, 2 * PAGE_SIZE, None, 0);
        let a = ObjectDesc::new(1, 2 * PAGE_SIZE, Arc::clone(&region)).build();
        let b = ObjectDesc::new(2, PAGE_SIZE, Arc::clone(&region)).build();

        let _pin = a.pin_pages_sync().unwrap();
        assert!(matches!(
            b.pin_pages_sync(),
            Err(MapError::ResourceExhausted)
        ));
    }

    #[test]
    fn purged_and_oversized_objects_fault_fatally() {
        let region = MemoryRegion::new("vram", MemClass::Device, 2 * PAGE_SIZE, None, 0);
        let obj = ObjectDesc::new(1, PAGE_SIZE, Arc::clone(&region)).build();
        obj.set_madvise(Madvise::Purged);
        assert!(matches!(obj.pin_pages_sync(), Err(MapError::FatalAccess)));

        let big = ObjectDesc::new(2, 4 * PAGE_SIZE, region).build();
        assert!(matches!(big.pin_pages_sync(), Err(MapError::FatalAccess)));
    }

    #[test]
    fn migration_moves_backing_and_respects_pins() {
        let vram = MemoryRegion::new("vram", MemClass::Device, 4 * PAGE_SIZE, Some(0x2000_0000), 0);
        let sys = MemoryRegion::new("sys", MemClass::System, 4 * PAGE_SIZE, None, 0x4000_0000);
        let obj = ObjectDesc::new(1, 2 * PAGE_SIZE, Arc::clone(&vram)).build();

        let pin = obj.pin_pages_sync().unwrap();
        assert!(matches!(
            obj.migrate_to_system(&sys),
            Err(MapError::DeviceBusy)
        ));
        drop(pin);

        obj.migrate_to_system(&sys).unwrap();
        assert_eq!(vram.avail(), 4 * PAGE_SIZE);
        assert_eq!(sys.avail(), 2 * PAGE_SIZE);
        assert!(obj.region().has_host_pages());
        assert_eq!(obj.page_phys(0), Some(0x4000_0000));
    }
}
