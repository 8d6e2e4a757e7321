//! Fence-register pool.
//!
//! A scarce pool shared across every bound object; tiled access through the
//! aperture requires one. Acquiring a fence may revoke an unpinned third
//! party's outstanding binding — contention policy, not an accident: the
//! displaced user refaults and re-arbitrates.

use super::{AperturePin, ApertureSpace};
use crate::error::{MapError, MapResult};
use crate::mmap::singleton::MmapSingleton;
use std::sync::{Arc, Weak};

pub(crate) struct FenceSlot {
    pub owner: Option<Weak<AperturePin>>,
}

impl ApertureSpace {
    /// Assign a fence register to the binding.
    ///
    /// # Errors
    /// `DeviceBusy` when every fence is held by a pinned binding; the fault
    /// path retries without progress.
    pub(crate) fn pin_fence(
        &self,
        pin: &Arc<AperturePin>,
        singleton: &MmapSingleton,
    ) -> MapResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if pin.fence.lock().unwrap().is_some() {
            return Ok(());
        }

        let free = inner
            .fences
            .iter()
            .position(|s| s.owner.as_ref().is_none_or(|w| w.upgrade().is_none()));

        let slot = match free {
            Some(slot) => slot,
            None => {
                let victim = inner.fences.iter().enumerate().find_map(|(slot, s)| {
                    let owner = s.owner.as_ref()?.upgrade()?;
                    (!owner.pinned()).then_some((slot, owner))
                });
                let Some((slot, owner)) = victim else {
                    return Err(MapError::DeviceBusy);
                };
                log::debug!(
                    "stealing fence {slot} from binding at aperture page {}",
                    owner.start_page()
                );
                Self::revoke_locked(&mut inner, &owner, singleton);
                slot
            }
        };

        inner.fences[slot].owner = Some(Arc::downgrade(pin));
        *pin.fence.lock().unwrap() = Some(slot);
        Ok(())
    }

    #[must_use]
    pub fn fences_in_use(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .fences
            .iter()
            .filter(|s| s.owner.as_ref().is_some_and(|w| w.upgrade().is_some()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ApertureSpace, BindFlags, View};
    use crate::PAGE_SIZE;
    use crate::error::MapError;
    use crate::mmap::singleton::MmapSingleton;
    use crate::object::ObjectDesc;
    use crate::object::pages::{MemClass, MemoryRegion};
    use std::sync::Arc;

    #[test]
    fn fence_steal_prefers_unpinned_owners() {
        let space = ApertureSpace::new(0x8000_0000, 64, 1);
        let singleton = MmapSingleton::attach(1024).unwrap();
        let region = MemoryRegion::new("vram", MemClass::Device, 64 * PAGE_SIZE, None, 0);
        let a = ObjectDesc::new(1, 4 * PAGE_SIZE, Arc::clone(&region)).tiled(1).build();
        let b = ObjectDesc::new(2, 4 * PAGE_SIZE, region).tiled(1).build();

        let hold_a = space
            .bind(&a, View::full(4), BindFlags::MAPPABLE, &singleton)
            .unwrap();
        space.pin_fence(&hold_a.pin, &singleton).unwrap();
        assert_eq!(space.fences_in_use(), 1);

        let hold_b = space
            .bind(&b, View::full(4), BindFlags::MAPPABLE, &singleton)
            .unwrap();
        // Owner is still pinned: contention fails transiently.
        assert!(matches!(
            space.pin_fence(&hold_b.pin, &singleton),
            Err(MapError::DeviceBusy)
        ));

        // Once the owner unpins, its fence is stolen.
        drop(hold_a);
        space.pin_fence(&hold_b.pin, &singleton).unwrap();
        assert_eq!(space.fences_in_use(), 1);
    }
}
