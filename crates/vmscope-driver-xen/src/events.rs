//! The monitor ring shared with the hypervisor and the conversions
//! between the library's access vocabulary and the hypervisor's.

use std::sync::atomic::{fence, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use vmscope_core::{
    AccessMode, Gfn, GuestEvent, MemoryAccess, Pa, RegisterId, Va, VcpuId,
};

use crate::{sys::ForeignMapping, Error};

///////////////////////////////////////////////////////////////////////////////
// Access conversion
///////////////////////////////////////////////////////////////////////////////

/// `XENMEM_access_*`: the access the guest is still *allowed*, which is
/// the inverse of the accesses the caller wants trapped.
const XENMEM_ACCESS_RWX: u32 = 7;
const XENMEM_ACCESS_RX2RW: u32 = 8;

/// Converts a trap request into the hypervisor's permitted-access value.
pub fn xen_access(mode: AccessMode) -> u32 {
    match mode {
        AccessMode::None => XENMEM_ACCESS_RWX,
        // Bit 0 = r, bit 1 = w, bit 2 = x, so the permitted-access value
        // is simply the complement of the trapped bits.
        AccessMode::Mask(bits) => !bits.bits() as u32 & XENMEM_ACCESS_RWX,
        AccessMode::ExecuteOnWrite => XENMEM_ACCESS_RX2RW,
    }
}

/// `VM_EVENT_X86_*` control-register indices.
pub fn ctrlreg_index(reg: RegisterId) -> Result<u16, Error> {
    match reg {
        RegisterId::Cr0 => Ok(0),
        RegisterId::Cr3 => Ok(1),
        RegisterId::Cr4 => Ok(2),
        _ => Err(Error::UnsupportedRegister),
    }
}

/// Maps a trappable MSR register to its architectural number.
pub fn msr_number(reg: RegisterId) -> Result<u32, Error> {
    match reg {
        RegisterId::SysenterCs => Ok(0x174),
        RegisterId::SysenterEsp => Ok(0x175),
        RegisterId::SysenterEip => Ok(0x176),
        RegisterId::MsrEfer => Ok(0xc000_0080),
        RegisterId::MsrStar => Ok(0xc000_0081),
        RegisterId::MsrLstar => Ok(0xc000_0082),
        RegisterId::MsrCstar => Ok(0xc000_0083),
        RegisterId::MsrSyscallMask => Ok(0xc000_0084),
        RegisterId::ShadowGs => Ok(0xc000_0102),
        _ => Err(Error::UnsupportedRegister),
    }
}

fn register_from_ctrlreg(index: u32) -> Option<RegisterId> {
    match index {
        0 => Some(RegisterId::Cr0),
        1 => Some(RegisterId::Cr3),
        2 => Some(RegisterId::Cr4),
        _ => None,
    }
}

fn register_from_msr(msr: u64) -> Option<RegisterId> {
    match msr {
        0x174 => Some(RegisterId::SysenterCs),
        0x175 => Some(RegisterId::SysenterEsp),
        0x176 => Some(RegisterId::SysenterEip),
        0xc000_0080 => Some(RegisterId::MsrEfer),
        0xc000_0081 => Some(RegisterId::MsrStar),
        0xc000_0082 => Some(RegisterId::MsrLstar),
        0xc000_0083 => Some(RegisterId::MsrCstar),
        0xc000_0084 => Some(RegisterId::MsrSyscallMask),
        0xc000_0102 => Some(RegisterId::ShadowGs),
        _ => None,
    }
}

///////////////////////////////////////////////////////////////////////////////
// Ring records
///////////////////////////////////////////////////////////////////////////////

pub const VM_EVENT_REASON_MEM_ACCESS: u32 = 1;
pub const VM_EVENT_REASON_MOV_TO_MSR: u32 = 2;
pub const VM_EVENT_REASON_SINGLESTEP: u32 = 4;
pub const VM_EVENT_REASON_WRITE_CTRLREG: u32 = 5;

const MEM_ACCESS_R: u32 = 1 << 0;
const MEM_ACCESS_W: u32 = 1 << 1;
const MEM_ACCESS_X: u32 = 1 << 2;

/// One monitor-ring record. Requests and responses share the layout; a
/// response echoes the request with flags the hypervisor interprets on
/// the way back.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VmEventRecord {
    pub version: u32,
    pub flags: u32,
    pub reason: u32,
    pub vcpu_id: u32,
    pub payload: [u8; 48],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct MemAccessPayload {
    gfn: u64,
    offset: u64,
    gla: u64,
    flags: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct WriteCtrlregPayload {
    index: u32,
    _pad: u32,
    new_value: u64,
    old_value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct MovToMsrPayload {
    msr: u64,
    new_value: u64,
    old_value: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SinglestepPayload {
    gla: u64,
    gfn: u64,
}

impl VmEventRecord {
    fn payload<T: FromBytes + KnownLayout + Immutable>(&self) -> T {
        T::read_from_prefix(&self.payload)
            .map(|(value, _)| value)
            .unwrap_or_else(|_| unreachable!("payload area is larger than any record"))
    }

    /// Decodes the record into the library's event type, dropping records
    /// the library has no vocabulary for.
    pub fn decode(&self) -> Option<GuestEvent> {
        let vcpu = VcpuId(self.vcpu_id as u16);

        match self.reason {
            VM_EVENT_REASON_MEM_ACCESS => {
                let payload: MemAccessPayload = self.payload();

                let mut access = MemoryAccess::empty();
                if payload.flags & MEM_ACCESS_R != 0 {
                    access |= MemoryAccess::R;
                }
                if payload.flags & MEM_ACCESS_W != 0 {
                    access |= MemoryAccess::W;
                }
                if payload.flags & MEM_ACCESS_X != 0 {
                    access |= MemoryAccess::X;
                }

                Some(GuestEvent::Memory {
                    gpa: Pa((payload.gfn << 12) + payload.offset),
                    gla: Va(payload.gla),
                    gfn: Gfn(payload.gfn),
                    access,
                    vcpu,
                })
            }
            VM_EVENT_REASON_WRITE_CTRLREG => {
                let payload: WriteCtrlregPayload = self.payload();

                Some(GuestEvent::Register {
                    reg: register_from_ctrlreg(payload.index)?,
                    value: payload.new_value,
                    previous: payload.old_value,
                    vcpu,
                })
            }
            VM_EVENT_REASON_MOV_TO_MSR => {
                let payload: MovToMsrPayload = self.payload();

                Some(GuestEvent::Register {
                    reg: register_from_msr(payload.msr)?,
                    value: payload.new_value,
                    previous: payload.old_value,
                    vcpu,
                })
            }
            VM_EVENT_REASON_SINGLESTEP => {
                let payload: SinglestepPayload = self.payload();

                Some(GuestEvent::Singlestep {
                    gla: Va(payload.gla),
                    gfn: Gfn(payload.gfn),
                    vcpu,
                })
            }
            _ => None,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// The shared ring
///////////////////////////////////////////////////////////////////////////////

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = std::mem::size_of::<VmEventRecord>();
const RING_SIZE: u32 = 32;

const REQ_PROD: usize = 0;
const RSP_PROD: usize = 8;

/// The single-page request/response ring shared with the hypervisor.
///
/// The hypervisor produces requests; we consume them and produce one
/// response per request before notifying the event channel.
pub struct VmEventRing {
    page: ForeignMapping,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl VmEventRing {
    /// Wraps the freshly enabled (zeroed) monitor page.
    pub fn new(page: ForeignMapping) -> Self {
        Self {
            page,
            req_cons: 0,
            rsp_prod_pvt: 0,
        }
    }

    fn header(&self, offset: usize) -> u32 {
        // SAFETY: The header lies within the mapped page and is updated by
        // the hypervisor; a volatile read observes the latest value.
        unsafe { (self.page.as_ptr().add(offset) as *const u32).read_volatile() }
    }

    fn set_header(&mut self, offset: usize, value: u32) {
        // SAFETY: As above; the producer index is only written by us.
        unsafe { (self.page.as_ptr().add(offset) as *mut u32).write_volatile(value) }
    }

    fn slot(&self, index: u32) -> usize {
        HEADER_SIZE + (index & (RING_SIZE - 1)) as usize * SLOT_SIZE
    }

    /// Whether the hypervisor has produced requests we have not consumed.
    pub fn has_unconsumed_requests(&self) -> bool {
        self.header(REQ_PROD) != self.req_cons
    }

    /// Takes the next request off the ring.
    pub fn get_request(&mut self) -> VmEventRecord {
        fence(Ordering::Acquire);

        let offset = self.slot(self.req_cons);
        let record = VmEventRecord::read_from_bytes(&self.page[offset..offset + SLOT_SIZE])
            .unwrap_or_else(|_| unreachable!("slot size equals record size"));

        self.req_cons = self.req_cons.wrapping_add(1);
        record
    }

    /// Puts one response on the ring and publishes it.
    pub fn put_response(&mut self, response: VmEventRecord) {
        let offset = self.slot(self.rsp_prod_pvt);
        self.page[offset..offset + SLOT_SIZE].copy_from_slice(response.as_bytes());

        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
        fence(Ordering::Release);
        self.set_header(RSP_PROD, self.rsp_prod_pvt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmscope_core::MemoryAccess;

    #[test]
    fn trap_request_inverts_into_permitted_access() {
        assert_eq!(xen_access(AccessMode::None), 7);
        assert_eq!(xen_access(AccessMode::Mask(MemoryAccess::R)), 6); // wx
        assert_eq!(xen_access(AccessMode::Mask(MemoryAccess::W)), 5); // rx
        assert_eq!(xen_access(AccessMode::Mask(MemoryAccess::X)), 3); // rw
        assert_eq!(xen_access(AccessMode::Mask(MemoryAccess::RW)), 4); // x
        assert_eq!(xen_access(AccessMode::Mask(MemoryAccess::RWX)), 0); // n
        assert_eq!(xen_access(AccessMode::ExecuteOnWrite), 8); // rx2rw
    }

    #[test]
    fn mem_access_record_decodes_to_a_memory_event() {
        let payload = MemAccessPayload {
            gfn: 0x1234,
            offset: 0x56,
            gla: 0xffff_8000_0000_0056,
            flags: MEM_ACCESS_W,
            _pad: 0,
        };

        let mut record = VmEventRecord {
            version: 1,
            flags: 0,
            reason: VM_EVENT_REASON_MEM_ACCESS,
            vcpu_id: 2,
            payload: [0; 48],
        };
        record.payload[..std::mem::size_of::<MemAccessPayload>()]
            .copy_from_slice(payload.as_bytes());

        match record.decode() {
            Some(GuestEvent::Memory {
                gpa,
                gfn,
                access,
                vcpu,
                ..
            }) => {
                assert_eq!(gpa, Pa(0x1234056));
                assert_eq!(gfn, Gfn(0x1234));
                assert_eq!(access, MemoryAccess::W);
                assert_eq!(vcpu, VcpuId(2));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_reasons_are_dropped() {
        let record = VmEventRecord {
            version: 1,
            flags: 0,
            reason: 0xdead,
            vcpu_id: 0,
            payload: [0; 48],
        };

        assert!(record.decode().is_none());
    }

    #[test]
    fn msr_mapping_is_symmetric() {
        for reg in [
            RegisterId::SysenterCs,
            RegisterId::MsrEfer,
            RegisterId::MsrLstar,
            RegisterId::ShadowGs,
        ] {
            let msr = msr_number(reg).unwrap();
            assert_eq!(register_from_msr(msr as u64), Some(reg));
        }
    }
}
