//! Device context: the process-wide state of the mapping core, scoped to
//! an attach/detach lifecycle and passed explicitly.

use crate::aperture::ApertureSpace;
use crate::device::power::PowerDomain;
use crate::device::reset::ResetBarrier;
use crate::error::{MapError, MapResult};
use crate::mmap::registry::{MappingRecord, OffsetManager};
use crate::mmap::singleton::MmapSingleton;
use crate::object::pages::{MemClass, MemoryRegion};
use crate::object::{BufferObject, Handle, ObjectDesc, ObjectFlags};
use crate::revoke::{self, ReleaseReason};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub has_aperture: bool,
    /// Write-combined and uncached kinds are available.
    pub pat: bool,
    /// A last-level cache covers aperture access to snooped backing.
    pub has_llc: bool,
    /// Compression metadata must be preserved alongside contents.
    pub flat_ccs: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            has_aperture: true,
            pat: true,
            has_llc: true,
            flat_ccs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub caps: DeviceCaps,
    /// Pages in the shared mapping-offset space.
    pub offset_space_pages: u64,
    pub aperture_pages: u64,
    /// Host address at which the aperture window is visible.
    pub aperture_host_base: u64,
    pub fence_count: usize,
    pub device_region_bytes: u64,
    /// Host window for direct access to device memory.
    pub device_io_base: Option<u64>,
    pub system_region_bytes: u64,
    pub autosuspend_debounce: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            caps: DeviceCaps::default(),
            offset_space_pages: 1 << 16,
            aperture_pages: 1 << 14,
            aperture_host_base: 0x8000_0000,
            fence_count: 16,
            device_region_bytes: 256 << 20,
            device_io_base: Some(0xc000_0000),
            system_region_bytes: 1 << 30,
            autosuspend_debounce: Duration::from_millis(250),
        }
    }
}

pub struct DeviceContext {
    pub caps: DeviceCaps,
    pub system_region: Arc<MemoryRegion>,
    pub device_region: Arc<MemoryRegion>,
    pub aperture: ApertureSpace,
    pub singleton: MmapSingleton,
    pub reset: ResetBarrier,
    pub power: PowerDomain,
    offsets: Mutex<OffsetManager>,
    /// Offset regions of objects pending destruction, reclaimed on demand.
    dead_regions: Mutex<Vec<(u64, u64)>>,
    objects: Mutex<HashMap<Handle, Arc<BufferObject>>>,
    /// Device-wide invalidation in flight; fault service bails out.
    revoking: AtomicBool,
    wedged: AtomicBool,
    pub(crate) faults: FaultCounter,
}

impl DeviceContext {
    /// Attach to a device: reserve the shared mapping range and set up the
    /// process-wide state. Everything tears down when the context drops.
    ///
    /// # Errors
    /// The host address reservation may fail.
    pub fn attach(config: DeviceConfig) -> MapResult<Arc<Self>> {
        let singleton = MmapSingleton::attach(config.offset_space_pages)?;
        Ok(Arc::new(Self {
            caps: config.caps,
            system_region: MemoryRegion::new(
                "system",
                MemClass::System,
                config.system_region_bytes,
                None,
                0x1_0000_0000,
            ),
            device_region: MemoryRegion::new(
                "device",
                MemClass::Device,
                config.device_region_bytes,
                config.device_io_base,
                0,
            ),
            aperture: ApertureSpace::new(
                config.aperture_host_base,
                config.aperture_pages,
                config.fence_count,
            ),
            singleton,
            reset: ResetBarrier::new(),
            power: PowerDomain::new(config.autosuspend_debounce),
            offsets: Mutex::new(OffsetManager::new(config.offset_space_pages)),
            dead_regions: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
            revoking: AtomicBool::new(false),
            wedged: AtomicBool::new(false),
            faults: FaultCounter::new(),
        }))
    }

    pub fn insert_object(&self, obj: Arc<BufferObject>) {
        self.objects.lock().unwrap().insert(obj.handle, obj);
    }

    /// Ref-counted lookup by handle.
    ///
    /// # Errors
    /// `NotFound` for stale handles.
    pub fn lookup_object(&self, handle: Handle) -> MapResult<Arc<BufferObject>> {
        self.objects
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(MapError::NotFound)
    }

    /// Destroy an object: revoke every mapping, tear down its registry and
    /// poison further faults on views that still reference it.
    pub fn destroy_object(&self, handle: Handle) {
        let Some(obj) = self.objects.lock().unwrap().remove(&handle) else {
            return;
        };
        revoke::release_all_mappings(self, &obj, ReleaseReason::Destruction);
        revoke::teardown_offset_records(self, &obj);
        for seg in &obj.segments {
            seg.release_backing();
        }
        obj.release_backing();
    }

    /// Invalidate every live mapping device-wide, e.g. before suspend.
    /// In-flight fault service drains first, so revocation never races a
    /// populate.
    pub fn suspend(&self) {
        self.revoking.store(true, Ordering::Release);
        self.faults.wait_idle();
        for obj in self.aperture.userfault_objects() {
            revoke::release_all_mappings(self, &obj, ReleaseReason::Suspend);
        }
    }

    pub fn resume(&self) {
        self.revoking.store(false, Ordering::Release);
    }

    pub(crate) fn is_revoking(&self) -> bool {
        self.revoking.load(Ordering::Acquire)
    }

    pub fn set_wedged(&self) {
        self.wedged.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Relaxed)
    }

    pub(crate) fn allocate_offsets(&self, pages: u64) -> Option<u64> {
        self.offsets.lock().unwrap().allocate(pages)
    }

    pub(crate) fn release_offsets(&self, start: u64, pages: u64) {
        self.offsets.lock().unwrap().release(start, pages);
    }

    pub(crate) fn register_node(&self, record: &Arc<MappingRecord>) {
        self.offsets.lock().unwrap().register(record);
    }

    pub(crate) fn lookup_node(&self, page_offset: u64) -> Option<Arc<MappingRecord>> {
        self.offsets.lock().unwrap().lookup(page_offset)
    }

    /// Queue a dead record's region; the space is reclaimed on demand.
    pub(crate) fn retire_record(&self, record: &MappingRecord) {
        self.offsets.lock().unwrap().unregister(record.offset);
        self.dead_regions
            .lock()
            .unwrap()
            .push((record.offset, record.pages));
    }

    /// Force reclamation of offset space held by destroyed objects.
    pub(crate) fn reclaim_dead_offsets(&self) {
        let pending: Vec<(u64, u64)> = {
            let mut dead = self.dead_regions.lock().unwrap();
            dead.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }
        let mut offsets = self.offsets.lock().unwrap();
        for (start, pages) in pending {
            offsets.release(start, pages);
        }
    }

    /// Host-backed shadow joining the object's synchronization domain.
    pub(crate) fn create_shadow(&self, obj: &Arc<BufferObject>, size: u64) -> Arc<BufferObject> {
        log::debug!(
            "shadowing object {} into system memory ({size} bytes)",
            obj.handle
        );
        ObjectDesc::new(obj.handle, size, Arc::clone(&self.system_region))
            .flags(ObjectFlags::CPU_CLEAR)
            .share_resv(Arc::clone(&obj.resv))
            .build()
    }
}

/// In-flight fault accounting; suspension waits for it to drain.
pub(crate) struct FaultCounter {
    active: Mutex<u32>,
    idle: Condvar,
}

impl FaultCounter {
    fn new() -> Self {
        Self {
            active: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub fn enter(&self) -> FaultTicket<'_> {
        *self.active.lock().unwrap() += 1;
        FaultTicket { counter: self }
    }

    pub fn wait_idle(&self) {
        let mut active = self.active.lock().unwrap();
        while *active > 0 {
            active = self.idle.wait(active).unwrap();
        }
    }
}

pub(crate) struct FaultTicket<'a> {
    counter: &'a FaultCounter,
}

impl Drop for FaultTicket<'_> {
    fn drop(&mut self) {
        let mut active = self.counter.active.lock().unwrap();
        *active -= 1;
        if *active == 0 {
            self.counter.idle.notify_all();
        }
    }
}
