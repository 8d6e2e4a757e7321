//! Aperture binding space.
//!
//! A single host-visible window of device address space shared by every
//! mapped object. Bindings are placed by hole search; under pressure the
//! resolver falls back to partial views and finally to eviction of
//! unpinned third-party bindings. One mutex serializes placement, the
//! fence pool and the userfault bookkeeping, so revocation-time
//! enumeration never observes a half-registered mapping.

pub mod fence;

use crate::error::{MapError, MapResult};
use crate::mmap::MapKind;
use crate::mmap::singleton::MmapSingleton;
use crate::object::BufferObject;
use bitflags::bitflags;
use fence::FenceSlot;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        /// Place within the host-visible window. Every fault bind sets it.
        const MAPPABLE = 1 << 0;
        /// Fail rather than wait for space.
        const NONBLOCK = 1 << 1;
        /// Never displace an existing binding.
        const NOEVICT = 1 << 2;
        /// First-fit placement only, no eviction scan.
        const NOSEARCH = 1 << 3;
    }
}

/// Window of an object bound into the aperture, in object pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub offset: u64,
    pub pages: u64,
}

impl View {
    #[must_use]
    pub fn full(object_pages: u64) -> Self {
        Self {
            offset: 0,
            pages: object_pages,
        }
    }

    #[must_use]
    pub fn is_full(&self, object_pages: u64) -> bool {
        self.offset == 0 && self.pages == object_pages
    }

    #[must_use]
    pub fn contains(&self, page: u64) -> bool {
        page >= self.offset && page < self.offset + self.pages
    }
}

/// A live binding of an object view into the aperture. Revocable; the
/// userfault flag ties it to the device-wide revocation list.
pub struct AperturePin {
    pub(crate) object: Weak<BufferObject>,
    pub view: View,
    /// First aperture page of the binding.
    start: u64,
    pin_count: AtomicU32,
    userfault: AtomicBool,
    write_tracked: AtomicBool,
    fence: Mutex<Option<usize>>,
}

impl AperturePin {
    #[must_use]
    pub fn start_page(&self) -> u64 {
        self.start
    }

    /// Writes went through this binding; teardown must account for them.
    #[must_use]
    pub fn is_write_tracked(&self) -> bool {
        self.write_tracked.load(Ordering::Relaxed)
    }

    pub(crate) fn set_write_tracked(&self) {
        self.write_tracked.store(true, Ordering::Relaxed);
    }

    fn pinned(&self) -> bool {
        self.pin_count.load(Ordering::SeqCst) > 0
    }
}

/// Pin count held for the duration of fault service. The binding itself
/// persists after drop, until evicted or revoked.
pub struct PinHold {
    pub pin: Arc<AperturePin>,
}

impl Drop for PinHold {
    fn drop(&mut self) {
        self.pin.pin_count.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ApertureInner {
    bound: Vec<Arc<AperturePin>>,
    /// Objects with live userfault mappings; drained by suspend.
    userfault_list: Vec<Weak<BufferObject>>,
    fences: Vec<FenceSlot>,
}

pub struct ApertureSpace {
    /// Host address at which the aperture window is visible.
    host_base: u64,
    pages: u64,
    inner: Mutex<ApertureInner>,
}

impl ApertureSpace {
    #[must_use]
    pub fn new(host_base: u64, pages: u64, fence_count: usize) -> Self {
        Self {
            host_base,
            pages,
            inner: Mutex::new(ApertureInner {
                bound: Vec::new(),
                userfault_list: Vec::new(),
                fences: (0..fence_count).map(|_| FenceSlot { owner: None }).collect(),
            }),
        }
    }

    #[must_use]
    pub fn host_base(&self) -> u64 {
        self.host_base
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Bind `view` of `obj`, reusing a live binding of the same window.
    ///
    /// # Errors
    /// `DeviceBusy` when no placement exists under the given flags; the
    /// fault path treats this as retry-without-progress.
    pub(crate) fn bind(
        &self,
        obj: &Arc<BufferObject>,
        view: View,
        flags: BindFlags,
        singleton: &MmapSingleton,
    ) -> MapResult<PinHold> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(pin) = inner.bound.iter().find(|p| {
            p.view == view && p.object.upgrade().is_some_and(|o| Arc::ptr_eq(&o, obj))
        }) {
            pin.pin_count.fetch_add(1, Ordering::SeqCst);
            return Ok(PinHold {
                pin: Arc::clone(pin),
            });
        }

        if view.pages > self.pages {
            return Err(MapError::DeviceBusy);
        }

        let start = match self.find_hole(&inner, view.pages) {
            Some(start) => start,
            None if flags.intersects(BindFlags::NOEVICT | BindFlags::NOSEARCH) => {
                return Err(MapError::DeviceBusy);
            }
            None => {
                Self::evict_unpinned(&mut inner, singleton);
                self.find_hole(&inner, view.pages)
                    .ok_or(MapError::DeviceBusy)?
            }
        };

        let pin = Arc::new(AperturePin {
            object: Arc::downgrade(obj),
            view,
            start,
            pin_count: AtomicU32::new(1),
            userfault: AtomicBool::new(false),
            write_tracked: AtomicBool::new(false),
            fence: Mutex::new(None),
        });
        inner.bound.push(Arc::clone(&pin));
        Ok(PinHold { pin })
    }

    fn find_hole(&self, inner: &ApertureInner, pages: u64) -> Option<u64> {
        let mut spans: Vec<(u64, u64)> = inner
            .bound
            .iter()
            .map(|p| (p.start, p.view.pages))
            .collect();
        spans.sort_unstable();

        let mut candidate = 0;
        for (start, len) in spans {
            if start > candidate && start - candidate >= pages {
                return Some(candidate);
            }
            candidate = candidate.max(start + len);
        }
        (candidate + pages <= self.pages).then_some(candidate)
    }

    fn evict_unpinned(inner: &mut ApertureInner, singleton: &MmapSingleton) {
        let victims: Vec<Arc<AperturePin>> =
            inner.bound.iter().filter(|p| !p.pinned()).cloned().collect();
        for victim in &victims {
            log::debug!("evicting aperture binding at page {}", victim.start);
            Self::revoke_locked(inner, victim, singleton);
        }
        inner.bound.retain(|p| p.pinned());
    }

    /// Tear down a binding's host mapping: zap its page-table entries,
    /// release its fence and settle the userfault bookkeeping. The caller
    /// holds the aperture mutex.
    fn revoke_locked(
        inner: &mut ApertureInner,
        pin: &Arc<AperturePin>,
        singleton: &MmapSingleton,
    ) {
        if let Some(slot) = pin.fence.lock().unwrap().take() {
            inner.fences[slot].owner = None;
        }

        let Some(obj) = pin.object.upgrade() else {
            pin.userfault.store(false, Ordering::SeqCst);
            return;
        };

        let record = obj.table.lock().unwrap().get(MapKind::Aperture);
        if let Some(record) = record {
            singleton.zap_record_range(&record, pin.view.offset, pin.view.pages);
        }

        if pin.userfault.swap(false, Ordering::SeqCst) {
            let prev = obj.userfault_count.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev > 0);
            if prev == 1 {
                inner
                    .userfault_list
                    .retain(|w| w.upgrade().is_some_and(|o| !Arc::ptr_eq(&o, &obj)));
            }
        }
    }

    /// Mark the binding as mapped into a host process and register the
    /// object for revocation, exactly once per binding.
    pub(crate) fn mark_userfault(&self, obj: &Arc<BufferObject>, pin: &Arc<AperturePin>) {
        let mut inner = self.inner.lock().unwrap();
        if !pin.userfault.swap(true, Ordering::SeqCst)
            && obj.userfault_count.fetch_add(1, Ordering::SeqCst) == 0
        {
            inner.userfault_list.push(Arc::downgrade(obj));
        }
    }

    /// Revoke every userfault mapping of `obj`. Idempotent; a no-op when
    /// the object has no live mappings.
    pub(crate) fn release_object(&self, obj: &Arc<BufferObject>, singleton: &MmapSingleton) {
        let mut inner = self.inner.lock().unwrap();
        if obj.userfault_count.load(Ordering::SeqCst) == 0 {
            return;
        }
        let pins: Vec<Arc<AperturePin>> = inner
            .bound
            .iter()
            .filter(|p| {
                p.userfault.load(Ordering::SeqCst)
                    && p.object.upgrade().is_some_and(|o| Arc::ptr_eq(&o, obj))
            })
            .cloned()
            .collect();
        for pin in &pins {
            Self::revoke_locked(&mut inner, pin, singleton);
        }
        debug_assert_eq!(obj.userfault_count.load(Ordering::SeqCst), 0);
    }

    /// Snapshot of the revocation list; dead entries are pruned.
    pub(crate) fn userfault_objects(&self) -> Vec<Arc<BufferObject>> {
        let mut inner = self.inner.lock().unwrap();
        inner.userfault_list.retain(|w| w.upgrade().is_some());
        inner
            .userfault_list
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    #[must_use]
    pub fn on_revocation_list(&self, obj: &Arc<BufferObject>) -> bool {
        self.inner
            .lock()
            .unwrap()
            .userfault_list
            .iter()
            .any(|w| w.upgrade().is_some_and(|o| Arc::ptr_eq(&o, obj)))
    }

    /// Number of live bindings, for pressure diagnostics.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.inner.lock().unwrap().bound.len()
    }

    /// Bindings of `obj` whose mappings have seen writes.
    #[must_use]
    pub fn write_tracked(&self, obj: &Arc<BufferObject>) -> usize {
        self.inner
            .lock()
            .unwrap()
            .bound
            .iter()
            .filter(|p| {
                p.object.upgrade().is_some_and(|o| Arc::ptr_eq(&o, obj)) && p.is_write_tracked()
            })
            .count()
    }
}
