use std::time::Duration;

use crate::{
    AccessMode, Error, FrameProtection, Gfn, GuestEvent, MappedFrame, Pa, RegEventDesc,
    RegisterId, SinglestepDesc, VcpuId, VmInfo,
};

/// The contract every memory backend implements.
///
/// The first block of operations is mandatory; the event plane has default
/// implementations returning [`Error::NotSupported`] so backends without
/// hypervisor event support (snapshot files, monitor-only connections)
/// satisfy the contract without stub boilerplate.
///
/// Backends release their resources in `Drop`; a failed operation must
/// leave no mapping or hypervisor state behind that the caller cannot see.
pub trait Driver {
    /// Retrieves static facts about the virtual machine.
    fn info(&self) -> Result<VmInfo, Error>;

    /// Returns the backend's numeric identifier for the VM.
    fn id(&self) -> u64;

    /// Returns the VM name.
    fn name(&self) -> Result<String, Error>;

    /// Resolves a VM name to its numeric identifier through the backend's
    /// directory.
    fn id_from_name(&self, _name: &str) -> Result<u64, Error> {
        Err(Error::NotSupported)
    }

    /// Resolves a numeric identifier to a VM name.
    fn name_from_id(&self, _id: u64) -> Result<String, Error> {
        Err(Error::NotSupported)
    }

    /// Maps one guest frame into the host with the requested protection.
    ///
    /// The mapping is released when the returned frame is dropped. A
    /// failed map is a normal failure, not a panic.
    fn map_frame(&self, gfn: Gfn, protection: FrameProtection) -> Result<MappedFrame, Error>;

    /// Writes a buffer to guest physical memory.
    ///
    /// The buffer may span pages; the backend slices it internally. The
    /// write is not atomic across pages: a failure on a later page leaves
    /// earlier pages written.
    fn write(&self, paddr: Pa, buf: &[u8]) -> Result<(), Error>;

    /// Reads one register of one vCPU.
    fn vcpureg(&self, reg: RegisterId, vcpu: VcpuId) -> Result<u64, Error>;

    /// Writes one register of one vCPU.
    ///
    /// Callers must pause the VM first; this is a contract, not a check.
    fn set_vcpureg(&self, _reg: RegisterId, _value: u64, _vcpu: VcpuId) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    /// Pauses the whole virtual machine.
    fn pause(&self) -> Result<(), Error>;

    /// Resumes the virtual machine.
    fn resume(&self) -> Result<(), Error>;

    /// Whether this backend can deliver events.
    fn events_supported(&self) -> bool {
        false
    }

    /// Programs a register access trap.
    fn set_reg_access(&self, _desc: &RegEventDesc) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    /// Programs the effective access mask for one guest frame.
    fn set_mem_access(&self, _gfn: Gfn, _access: AccessMode) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    /// Starts single-stepping the vCPUs selected by the descriptor.
    fn start_single_step(&self, _desc: &SinglestepDesc) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    /// Stops single-stepping one vCPU.
    fn stop_single_step(&self, _vcpu: VcpuId) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    /// Disables single-stepping on every vCPU.
    fn shutdown_single_step(&self) -> Result<(), Error> {
        Err(Error::NotSupported)
    }

    /// Blocks up to `timeout` while dispatching pending hypervisor
    /// notifications into `sink`.
    ///
    /// A zero timeout is a non-blocking poll. Returning with no events
    /// delivered is success, not an error.
    fn listen(
        &self,
        _timeout: Duration,
        _sink: &mut dyn FnMut(&GuestEvent),
    ) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
}
