//! vmscope — guest-memory introspection for live Xen and KVM guests and
//! offline physical-memory snapshots.
//!
//! A [`Vmscope`] session ties one memory backend to a page-frame cache
//! and an event registry. Memory can be read and written by physical
//! address, by virtual address through the guest's own page tables, or
//! by kernel symbol; vCPU registers are exposed through a unified
//! register namespace; and memory, register, and single-step events can
//! be trapped and delivered to callbacks.
//!
//! ```no_run
//! use vmscope::{InitOptions, Pa, VmTarget, Vmscope};
//!
//! # fn main() -> Result<(), vmscope::Error> {
//! let vm = Vmscope::init(
//!     VmTarget::Snapshot("memory.dump".into()),
//!     InitOptions::default(),
//! )?;
//!
//! let mut buf = [0u8; 16];
//! vm.read_pa(Pa(0x1000), &mut buf)?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod events;
mod session;

#[cfg(test)]
mod testutil;

pub use vmscope_arch_amd64::{PageMode, Registers, SegmentDescriptor};
pub use vmscope_core::{
    config::{self, ConfigEntry},
    os::{LinuxOffsets, OsProfile, OsType, WindowsOffsets},
    AccessMode, AddressSpace, Driver, Error, EventSpec, FrameProtection, Gfn, Granularity,
    GuestEvent, MappedFrame, MemEventDesc, MemoryAccess, Pa, RegAccess, RegEventDesc, RegisterId,
    SinglestepDesc, Va, VcpuId, VcpuSet, VmInfo,
};

#[cfg(feature = "kvm")]
pub use vmscope_driver_kvm::{KvmMemoryPath, KvmOptions};

pub use self::{
    backend::BackendKind,
    events::EventCallback,
    session::{InitFlags, InitOptions, PauseGuard, VmTarget, Vmscope},
};
