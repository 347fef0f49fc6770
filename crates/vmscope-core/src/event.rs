use crate::{AccessMode, Gfn, MemoryAccess, Pa, RegAccess, RegisterId, Va, VcpuId, VcpuSet};

/// The granularity of a memory event registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Trap any access to the page.
    Page,

    /// Trap accesses to one byte address; other accesses to the same page
    /// are filtered out before the callback fires.
    Byte,
}

/// A memory event registration request.
#[derive(Debug, Clone, Copy)]
pub struct MemEventDesc {
    /// The guest physical address to watch. For page granularity any
    /// address within the page selects the whole page.
    pub paddr: Pa,

    /// Page or byte granularity.
    pub granularity: Granularity,

    /// The accesses to trap.
    pub access: AccessMode,
}

/// A register event registration request.
#[derive(Debug, Clone, Copy)]
pub struct RegEventDesc {
    /// The register to watch.
    pub reg: RegisterId,

    /// The accesses to trap.
    pub access: RegAccess,
}

/// A single-step registration request.
#[derive(Debug, Clone, Copy)]
pub struct SinglestepDesc {
    /// The vCPUs to single-step.
    pub vcpus: VcpuSet,
}

/// An event registration request, one variant per registry table.
#[derive(Debug, Clone, Copy)]
pub enum EventSpec {
    /// A memory access event.
    Memory(MemEventDesc),

    /// A register access event.
    Register(RegEventDesc),

    /// A single-step event.
    Singlestep(SinglestepDesc),
}

/// An event delivered by the hypervisor, as decoded by the backend.
///
/// The registry matches each delivered event against its registrations and
/// hands it to the user callback unchanged.
#[derive(Debug, Clone, Copy)]
pub enum GuestEvent {
    /// A trapped memory access.
    Memory {
        /// The guest physical address that was accessed.
        gpa: Pa,

        /// The guest virtual address of the access, if the hypervisor
        /// reported one.
        gla: Va,

        /// The frame the access landed in.
        gfn: Gfn,

        /// The kind of access that fired the trap.
        access: MemoryAccess,

        /// The vCPU the access happened on.
        vcpu: VcpuId,
    },

    /// A trapped register access.
    Register {
        /// The register that was accessed.
        reg: RegisterId,

        /// The new register value.
        value: u64,

        /// The value before the access.
        previous: u64,

        /// The vCPU the access happened on.
        vcpu: VcpuId,
    },

    /// A completed single-stepped instruction.
    Singlestep {
        /// The instruction pointer after the step.
        gla: Va,

        /// The frame the instruction pointer lies in.
        gfn: Gfn,

        /// The stepped vCPU.
        vcpu: VcpuId,
    },
}

impl GuestEvent {
    /// Returns the vCPU the event originated on.
    pub fn vcpu(&self) -> VcpuId {
        match self {
            Self::Memory { vcpu, .. }
            | Self::Register { vcpu, .. }
            | Self::Singlestep { vcpu, .. } => *vcpu,
        }
    }
}
