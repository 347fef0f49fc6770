use std::{
    cell::{Cell, RefCell},
    time::Duration,
};

use zerocopy::FromBytes;

use vmscope_core::{
    AccessMode, Driver, Error as VmiError, FrameProtection, Gfn, GuestEvent, MappedFrame, Pa,
    RegEventDesc, RegisterId, SinglestepDesc, VcpuId, VmInfo,
};
use vmscope_arch_amd64::{efer_long_mode, Registers, PAGE_SHIFT, PAGE_SIZE};

use crate::{
    events::{ctrlreg_index, msr_number, xen_access, VmEventRing},
    registers::{apply_to_hvm, pv32_read, pv32_write, pv64_read, pv64_write},
    sys::{
        EventChannel, HvmHwCpu, HvmSaveDescriptor, XcDomInfo, XenControl, Xenstore,
        DEBUG_OP_SINGLE_STEP_OFF, DEBUG_OP_SINGLE_STEP_ON, HVM_SAVE_CODE_CPU,
    },
    Error,
};

struct XenEvents {
    ring: RefCell<VmEventRing>,
    channel: EventChannel,
    singlestep_armed: Cell<bool>,
}

/// Backend over a live Xen domain.
pub struct XenDriver {
    xc: XenControl,
    xs: Option<Xenstore>,
    domid: u32,
    info: XcDomInfo,
    address_width: u8,
    events: Option<XenEvents>,
}

impl XenDriver {
    /// Checks whether the domain exists without keeping any state.
    pub fn probe(domid: u32) -> bool {
        XenControl::open()
            .and_then(|xc| xc.domain_info(domid))
            .is_ok()
    }

    /// Resolves a domain name to its id through a transient xenstore
    /// connection, before any domain handle exists.
    pub fn domid_from_name(name: &str) -> Result<u32, Error> {
        let xs = Xenstore::open()?;

        for domid in xs.directory("/local/domain")? {
            let Some(candidate) = xs.read(&format!("/local/domain/{domid}/name")) else {
                continue;
            };

            // Names are compared up to 100 bytes.
            let limit = 100;
            if candidate.as_bytes().iter().take(limit).eq(name.as_bytes().iter().take(limit)) {
                return domid.parse().map_err(|_| Error::Control("malformed domain id"));
            }
        }

        Err(Error::DomainNotFound(u32::MAX))
    }

    /// Opens control handles for one domain, optionally enabling the
    /// event plane.
    pub fn new(domid: u32, events: bool) -> Result<Self, Error> {
        let xc = XenControl::open()?;
        let info = xc.domain_info(domid)?;

        // Xenstore is optional: without it only name resolution is lost.
        let xs = Xenstore::open().ok();

        let address_width = Self::discover_address_width(&xc, domid, info.hvm())?;

        let events = if events {
            if !info.hvm() {
                return Err(Error::NotSupported);
            }

            let (page, port) = xc.monitor_enable(domid)?;
            let channel = match EventChannel::bind(domid, port) {
                Ok(channel) => channel,
                Err(err) => {
                    let _ = xc.monitor_disable(domid);
                    return Err(err);
                }
            };

            Some(XenEvents {
                ring: RefCell::new(VmEventRing::new(page)),
                channel,
                singlestep_armed: Cell::new(false),
            })
        } else {
            None
        };

        Ok(Self {
            xc,
            xs,
            domid,
            info,
            address_width,
            events,
        })
    }

    /// The domain this driver is attached to.
    pub fn domid(&self) -> u32 {
        self.domid
    }

    fn discover_address_width(xc: &XenControl, domid: u32, hvm: bool) -> Result<u8, Error> {
        if hvm {
            let cpu = xc.hvm_context_partial(domid, 0)?;
            return Ok(if efer_long_mode(cpu.msr_efer) { 8 } else { 4 });
        }

        match (xc.address_size(domid)? / 8) as u8 {
            width @ (4 | 8) => Ok(width),
            _ => Err(Error::InvalidAddressWidth),
        }
    }

    fn hvm_registers(&self, vcpu: VcpuId) -> Result<Registers, Error> {
        let cpu = self.xc.hvm_context_partial(self.domid, vcpu.0)?;
        Ok(Registers::from(&cpu))
    }

    /// Patches one register in the full HVM context and stores it back.
    ///
    /// The hypervisor offers no partial-set operation, so the whole blob
    /// makes the round trip. The caller must have paused the domain.
    fn hvm_set_register(&self, reg: RegisterId, value: u64, vcpu: VcpuId) -> Result<(), Error> {
        let mut blob = self.xc.hvm_context(self.domid)?;

        let mut offset = 0usize;
        while offset + std::mem::size_of::<HvmSaveDescriptor>() <= blob.len() {
            let descriptor = HvmSaveDescriptor::read_from_bytes(
                &blob[offset..offset + std::mem::size_of::<HvmSaveDescriptor>()],
            )
            .unwrap_or_else(|_| unreachable!("descriptor slice has the exact size"));
            offset += std::mem::size_of::<HvmSaveDescriptor>();

            if descriptor.typecode == HVM_SAVE_CODE_CPU && descriptor.instance == vcpu.0 {
                let end = offset + std::mem::size_of::<HvmHwCpu>();
                if end > blob.len() {
                    return Err(Error::Control("truncated HVM context"));
                }

                // Patch a copy of the record; the blob carries no
                // alignment guarantees.
                let mut cpu = HvmHwCpu::read_from_bytes(&blob[offset..end])
                    .unwrap_or_else(|_| unreachable!("record slice has the exact size"));

                let mut regs = Registers::from(&cpu);
                regs.write(reg, value);
                apply_to_hvm(&regs, &mut cpu);

                blob[offset..end].copy_from_slice(zerocopy::IntoBytes::as_bytes(&cpu));
                return self.xc.set_hvm_context(self.domid, &mut blob);
            }

            offset += descriptor.length as usize;
        }

        Err(Error::Control("vCPU record not found in HVM context"))
    }
}

impl Driver for XenDriver {
    fn info(&self) -> Result<VmInfo, VmiError> {
        Ok(VmInfo {
            page_size: PAGE_SIZE,
            page_shift: PAGE_SHIFT,
            memsize: self.info.nr_pages * PAGE_SIZE,
            vcpus: (self.info.max_vcpu_id + 1) as u16,
            address_width: self.address_width,
            hvm: self.info.hvm(),
        })
    }

    fn id(&self) -> u64 {
        self.domid as u64
    }

    fn name(&self) -> Result<String, VmiError> {
        self.name_from_id(self.domid as u64)
    }

    fn id_from_name(&self, name: &str) -> Result<u64, VmiError> {
        let xs = self.xs.as_ref().ok_or(VmiError::NotSupported)?;

        for domid in xs.directory("/local/domain").map_err(VmiError::from)? {
            let Some(candidate) = xs.read(&format!("/local/domain/{domid}/name")) else {
                continue;
            };

            // Names are compared up to 100 bytes, as the directory is.
            let limit = 100;
            if candidate.as_bytes().iter().take(limit).eq(name.as_bytes().iter().take(limit)) {
                return domid.parse().map_err(|_| VmiError::Other("malformed domain id"));
            }
        }

        Err(VmiError::NotFound)
    }

    fn name_from_id(&self, id: u64) -> Result<String, VmiError> {
        let xs = self.xs.as_ref().ok_or(VmiError::NotSupported)?;

        xs.read(&format!("/local/domain/{id}/name"))
            .ok_or(VmiError::NotFound)
    }

    fn map_frame(&self, gfn: Gfn, protection: FrameProtection) -> Result<MappedFrame, VmiError> {
        let prot = match protection {
            FrameProtection::Read => libc::PROT_READ,
            FrameProtection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        let mapping = self
            .xc
            .map_foreign_page(self.domid, gfn.0, prot)
            .map_err(VmiError::from)?;

        Ok(MappedFrame::new(mapping))
    }

    fn write(&self, paddr: Pa, buf: &[u8]) -> Result<(), VmiError> {
        let mut position = 0usize;
        let mut remaining = buf.len();

        // One transient read-write mapping per page slice. A failed slice
        // aborts with the earlier slices already written; the caller is
        // expected to have paused the domain.
        while remaining > 0 {
            let address = paddr.0 + position as u64;
            let pfn = address >> PAGE_SHIFT;
            let offset = (address & (PAGE_SIZE - 1)) as usize;
            let length = remaining.min(PAGE_SIZE as usize - offset);

            let mut mapping = self
                .xc
                .map_foreign_page(self.domid, pfn, libc::PROT_READ | libc::PROT_WRITE)
                .map_err(VmiError::from)?;
            mapping[offset..offset + length].copy_from_slice(&buf[position..position + length]);

            position += length;
            remaining -= length;
        }

        Ok(())
    }

    fn vcpureg(&self, reg: RegisterId, vcpu: VcpuId) -> Result<u64, VmiError> {
        if self.info.hvm() {
            return Ok(self.hvm_registers(vcpu).map_err(VmiError::from)?.read(reg));
        }

        let ctx = self
            .xc
            .vcpu_context(self.domid, vcpu.0 as u32)
            .map_err(VmiError::from)?;

        // SAFETY: The union is read through the layout matching the
        // discovered guest address width.
        let value = unsafe {
            match self.address_width {
                8 => pv64_read(&ctx.x64, reg),
                _ => pv32_read(&ctx.x32, reg),
            }
        };

        Ok(value.map_err(VmiError::from)?)
    }

    fn set_vcpureg(&self, reg: RegisterId, value: u64, vcpu: VcpuId) -> Result<(), VmiError> {
        if self.info.hvm() {
            return Ok(self.hvm_set_register(reg, value, vcpu).map_err(VmiError::from)?);
        }

        let mut ctx = self
            .xc
            .vcpu_context(self.domid, vcpu.0 as u32)
            .map_err(VmiError::from)?;

        // SAFETY: As in `vcpureg`.
        let result = unsafe {
            match self.address_width {
                8 => pv64_write(&mut ctx.x64, reg, value),
                _ => pv32_write(&mut ctx.x32, reg, value),
            }
        };
        result.map_err(VmiError::from)?;

        self.xc
            .set_vcpu_context(self.domid, vcpu.0 as u32, &mut ctx)
            .map_err(VmiError::from)?;
        Ok(())
    }

    fn pause(&self) -> Result<(), VmiError> {
        Ok(self.xc.pause(self.domid).map_err(VmiError::from)?)
    }

    fn resume(&self) -> Result<(), VmiError> {
        Ok(self.xc.unpause(self.domid).map_err(VmiError::from)?)
    }

    fn events_supported(&self) -> bool {
        self.events.is_some()
    }

    fn set_reg_access(&self, desc: &RegEventDesc) -> Result<(), VmiError> {
        if self.events.is_none() {
            return Err(VmiError::NotSupported);
        }

        let enable = !desc.access.is_empty();
        tracing::trace!(reg = ?desc.reg, enable, "set register access");

        if let Ok(index) = ctrlreg_index(desc.reg) {
            const SYNC: bool = true;
            const ON_CHANGE_ONLY: bool = false;

            return Ok(self
                .xc
                .monitor_write_ctrlreg(self.domid, index, enable, SYNC, ON_CHANGE_ONLY)
                .map_err(VmiError::from)?);
        }

        let msr = msr_number(desc.reg).map_err(VmiError::from)?;
        Ok(self
            .xc
            .monitor_mov_to_msr(self.domid, msr, enable)
            .map_err(VmiError::from)?)
    }

    fn set_mem_access(&self, gfn: Gfn, access: AccessMode) -> Result<(), VmiError> {
        if self.events.is_none() {
            return Err(VmiError::NotSupported);
        }

        tracing::trace!(%gfn, %access, "set memory access");
        Ok(self
            .xc
            .set_mem_access(self.domid, xen_access(access), gfn.0, 1)
            .map_err(VmiError::from)?)
    }

    fn start_single_step(&self, desc: &SinglestepDesc) -> Result<(), VmiError> {
        let events = self.events.as_ref().ok_or(VmiError::NotSupported)?;

        if !events.singlestep_armed.get() {
            self.xc
                .monitor_singlestep(self.domid, true)
                .map_err(VmiError::from)?;
            events.singlestep_armed.set(true);
        }

        let vcpus = (self.info.max_vcpu_id + 1) as u16;
        for vcpu in desc.vcpus.iter(vcpus) {
            self.xc
                .debug_control(self.domid, DEBUG_OP_SINGLE_STEP_ON, vcpu.0 as u32)
                .map_err(VmiError::from)?;
        }

        Ok(())
    }

    fn stop_single_step(&self, vcpu: VcpuId) -> Result<(), VmiError> {
        if self.events.is_none() {
            return Err(VmiError::NotSupported);
        }

        Ok(self
            .xc
            .debug_control(self.domid, DEBUG_OP_SINGLE_STEP_OFF, vcpu.0 as u32)
            .map_err(VmiError::from)?)
    }

    fn shutdown_single_step(&self) -> Result<(), VmiError> {
        let events = self.events.as_ref().ok_or(VmiError::NotSupported)?;

        for vcpu in 0..=self.info.max_vcpu_id {
            let _ = self.xc.debug_control(self.domid, DEBUG_OP_SINGLE_STEP_OFF, vcpu);
        }

        self.xc
            .monitor_singlestep(self.domid, false)
            .map_err(VmiError::from)?;
        events.singlestep_armed.set(false);
        Ok(())
    }

    fn listen(
        &self,
        timeout: Duration,
        sink: &mut dyn FnMut(&GuestEvent),
    ) -> Result<(), VmiError> {
        let events = self.events.as_ref().ok_or(VmiError::NotSupported)?;

        let timeout: i32 = timeout
            .as_millis()
            .try_into()
            .map_err(|_| VmiError::InvalidTimeout)?;

        let mut fds = [libc::pollfd {
            fd: events.channel.fd(),
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        }];

        // SAFETY: `fds` is a valid array of one initialized pollfd.
        let poll_result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as _, timeout) };

        match poll_result {
            // Nothing arrived within the timeout; not an error.
            0 => return Ok(()),
            -1 => return Err(VmiError::Io(std::io::Error::last_os_error())),
            _ => (),
        }

        events.channel.acknowledge().map_err(VmiError::from)?;

        while events.ring.borrow().has_unconsumed_requests() {
            let request = events.ring.borrow_mut().get_request();

            if let Some(event) = request.decode() {
                sink(&event);
            } else {
                tracing::debug!(reason = request.reason, "dropping unrecognized vm event");
            }

            events.ring.borrow_mut().put_response(request);
        }

        events.channel.notify().map_err(VmiError::from)?;
        Ok(())
    }
}

impl Drop for XenDriver {
    fn drop(&mut self) {
        if let Some(events) = &self.events {
            if events.singlestep_armed.get() {
                let _ = self.xc.monitor_singlestep(self.domid, false);
            }
            let _ = self.xc.monitor_disable(self.domid);
        }
    }
}
