//! Swap/migration policy.
//!
//! Both decisions taken at fault time — whether to service the fault from a
//! shadow backing and whether to move the target into system memory — are
//! pure functions of a state snapshot, kept apart from fault control flow.

use crate::device::context::DeviceContext;
use crate::object::pages::Madvise;
use crate::object::{BufferObject, ObjectFlags};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    WillNeed,
    DontNeed,
}

/// Object state the backing decision is taken from.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub device_local: bool,
    pub has_pages: bool,
    pub purged: bool,
    pub size: u64,
    /// Free budget of the object's home region.
    pub region_avail: u64,
    pub force_offload: bool,
    /// Compression metadata must ride along with the contents.
    pub preserve_compression: bool,
    pub wedged: bool,
    pub shadow: Option<ShadowState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingDecision {
    /// Service the fault from the existing shadow.
    UseShadow,
    /// Create a host-backed shadow of the given size.
    CreateShadow { size: u64 },
    KeepPrimary,
}

/// Choose the backing for a direct fault.
#[must_use]
pub fn choose_backing(s: &PolicySnapshot, write: bool) -> BackingDecision {
    if s.shadow == Some(ShadowState::WillNeed) {
        return BackingDecision::UseShadow;
    }

    if !s.device_local || s.has_pages || s.purged {
        return BackingDecision::KeepPrimary;
    }

    // Prefer writing straight to device memory unless that would evict.
    if write && 2 * s.size < s.region_avail && !s.force_offload {
        return BackingDecision::KeepPrimary;
    }

    let mut size = s.size;
    if s.preserve_compression && !s.wedged {
        size += size >> 8;
    }
    BackingDecision::CreateShadow { size }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateDecision {
    No,
    /// Best effort; a failure leaves the fault serviced unmigrated.
    Optional,
    /// The access cannot be serviced from device memory at all.
    Required,
}

#[derive(Debug, Clone, Copy)]
pub struct MigrateSnapshot {
    pub device_local: bool,
    pub host_atomics: bool,
    pub prefer_system: bool,
}

#[must_use]
pub fn migrate_intent(s: &MigrateSnapshot) -> MigrateDecision {
    if !s.device_local {
        return MigrateDecision::No;
    }
    if s.host_atomics {
        MigrateDecision::Required
    } else if s.prefer_system {
        MigrateDecision::Optional
    } else {
        MigrateDecision::No
    }
}

pub(crate) fn snapshot(ctx: &DeviceContext, obj: &BufferObject) -> PolicySnapshot {
    let mm = obj.mm.lock().unwrap();
    let shadow = mm.shadow.as_ref().map(|s| match s.madvise() {
        Madvise::WillNeed => ShadowState::WillNeed,
        _ => ShadowState::DontNeed,
    });
    PolicySnapshot {
        device_local: !mm.region.has_host_pages(),
        has_pages: mm.pages.is_some(),
        purged: mm.madv == Madvise::Purged,
        size: obj.size,
        region_avail: mm.region.avail(),
        force_offload: obj.flags.contains(ObjectFlags::FORCE_OFFLOAD),
        preserve_compression: ctx.caps.flat_ccs,
        wedged: ctx.is_wedged(),
        shadow,
    }
}

pub(crate) fn migrate_snapshot(obj: &BufferObject) -> MigrateSnapshot {
    MigrateSnapshot {
        device_local: !obj.region().has_host_pages(),
        host_atomics: obj.flags.contains(ObjectFlags::HOST_ATOMICS),
        prefer_system: obj.flags.contains(ObjectFlags::SMEM_ON_FAULT),
    }
}

/// Apply the backing decision: substitute or create the shadow. A created
/// shadow joins the object's synchronization domain and stays the
/// preferred target until marked not-needed.
pub(crate) fn apply(
    ctx: &DeviceContext,
    obj: &Arc<BufferObject>,
    write: bool,
) -> Arc<BufferObject> {
    match choose_backing(&snapshot(ctx, obj), write) {
        BackingDecision::UseShadow => obj.shadow().unwrap_or_else(|| Arc::clone(obj)),
        BackingDecision::KeepPrimary => Arc::clone(obj),
        BackingDecision::CreateShadow { size } => {
            let shadow = ctx.create_shadow(obj, size);
            obj.set_shadow(Arc::clone(&shadow));
            shadow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PolicySnapshot {
        PolicySnapshot {
            device_local: true,
            has_pages: false,
            purged: false,
            size: 1 << 20,
            region_avail: 1 << 24,
            force_offload: false,
            preserve_compression: false,
            wedged: false,
            shadow: None,
        }
    }

    #[test]
    fn writes_with_headroom_stay_in_device_memory() {
        let s = base();
        assert_eq!(choose_backing(&s, true), BackingDecision::KeepPrimary);
    }

    #[test]
    fn writes_under_budget_pressure_get_a_shadow() {
        let s = PolicySnapshot {
            region_avail: 2 * (1 << 20),
            ..base()
        };
        assert_eq!(
            choose_backing(&s, true),
            BackingDecision::CreateShadow { size: 1 << 20 }
        );
    }

    #[test]
    fn reads_of_unbacked_device_objects_get_a_shadow() {
        let s = base();
        assert_eq!(
            choose_backing(&s, false),
            BackingDecision::CreateShadow { size: 1 << 20 }
        );
    }

    #[test]
    fn resident_or_purged_objects_keep_primary() {
        let s = PolicySnapshot {
            has_pages: true,
            ..base()
        };
        assert_eq!(choose_backing(&s, false), BackingDecision::KeepPrimary);

        let s = PolicySnapshot {
            purged: true,
            ..base()
        };
        assert_eq!(choose_backing(&s, true), BackingDecision::KeepPrimary);
    }

    #[test]
    fn existing_willneed_shadow_is_preferred() {
        let s = PolicySnapshot {
            shadow: Some(ShadowState::WillNeed),
            has_pages: true,
            ..base()
        };
        assert_eq!(choose_backing(&s, true), BackingDecision::UseShadow);

        // A not-needed shadow falls through to the create logic.
        let s = PolicySnapshot {
            shadow: Some(ShadowState::DontNeed),
            ..base()
        };
        assert_eq!(
            choose_backing(&s, false),
            BackingDecision::CreateShadow { size: s.size }
        );
    }

    #[test]
    fn compression_metadata_inflates_the_shadow() {
        let s = PolicySnapshot {
            preserve_compression: true,
            ..base()
        };
        let expect = (1 << 20) + ((1u64 << 20) >> 8);
        assert_eq!(
            choose_backing(&s, false),
            BackingDecision::CreateShadow { size: expect }
        );

        // A wedged device skips the inflation.
        let s = PolicySnapshot { wedged: true, ..s };
        assert_eq!(
            choose_backing(&s, false),
            BackingDecision::CreateShadow { size: 1 << 20 }
        );
    }

    #[test]
    fn forced_offload_overrides_the_write_headroom() {
        let s = PolicySnapshot {
            force_offload: true,
            ..base()
        };
        assert_eq!(
            choose_backing(&s, true),
            BackingDecision::CreateShadow { size: 1 << 20 }
        );
    }

    #[test]
    fn migration_is_required_only_for_host_atomics() {
        let s = MigrateSnapshot {
            device_local: true,
            host_atomics: true,
            prefer_system: false,
        };
        assert_eq!(migrate_intent(&s), MigrateDecision::Required);

        let s = MigrateSnapshot {
            host_atomics: false,
            prefer_system: true,
            ..s
        };
        assert_eq!(migrate_intent(&s), MigrateDecision::Optional);

        let s = MigrateSnapshot {
            device_local: false,
            ..s
        };
        assert_eq!(migrate_intent(&s), MigrateDecision::No);
    }
}
