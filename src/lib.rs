pub mod aperture;
pub mod device;
pub mod error;
pub mod fault;
pub mod mmap;
pub mod object;
pub mod revoke;
pub mod txn;

pub use device::context::{DeviceCaps, DeviceConfig, DeviceContext};
pub use error::{MapError, MapResult};
pub use fault::FaultOutcome;
pub use mmap::MapKind;
pub use object::{BufferObject, ObjectDesc};

/// Page granularity shared by the offset space, the aperture and the
/// page-table model.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
