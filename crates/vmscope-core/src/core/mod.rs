mod address;
mod info;
pub(crate) mod macros;
mod memory_access;
mod vcpu;

pub use self::{
    address::{AddressSpace, Gfn, Pa, Va},
    info::VmInfo,
    memory_access::{FrameProtection, MemoryAccess},
    vcpu::{VcpuId, VcpuSet},
};
