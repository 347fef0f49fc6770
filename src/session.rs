use std::{cell::{Cell, RefCell}, path::PathBuf, time::Duration};

use vmscope_core::{
    config::ConfigEntry,
    os::{lookup_sysmap_symbol, OsProfile, OsType},
    AddressSpace, Driver, Error, EventSpec, FrameProtection, Gfn, Granularity, MemEventDesc, Pa,
    PageCache, RegEventDesc, RegisterId, SinglestepDesc, Va, VcpuId, VmInfo,
};
use vmscope_arch_amd64::{translate, PageMode};

use crate::{
    backend::{Backend, BackendKind},
    events::{EventCallback, EventRegistry},
};

bitflags::bitflags! {
    /// What to bring up at initialization.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u32 {
        /// Memory access only.
        const PARTIAL = 1 << 0;

        /// Also introspect the guest OS (requires a configuration entry).
        const COMPLETE = 1 << 1;

        /// Enable event delivery.
        const EVENTS = 1 << 2;
    }
}

/// The VM to attach to.
#[derive(Debug, Clone)]
pub enum VmTarget {
    /// A VM name, resolved through the backend's directory.
    Name(String),

    /// A numeric VM identifier.
    Id(u64),

    /// A physical-memory snapshot file.
    Snapshot(PathBuf),
}

/// Initialization parameters beyond the target itself.
pub struct InitOptions {
    /// Which backend to use; `Auto` probes the compiled-in ones.
    pub backend: BackendKind,

    /// Initialization flags.
    pub flags: InitFlags,

    /// The configuration entry for this VM (required for
    /// [`InitFlags::COMPLETE`]).
    pub config: Option<ConfigEntry>,

    /// Page-cache soft cap override (0 = unbounded).
    pub cache_capacity: Option<usize>,

    /// Connection parameters for the KVM backend.
    #[cfg(feature = "kvm")]
    pub kvm: Option<vmscope_driver_kvm::KvmOptions>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            flags: InitFlags::PARTIAL,
            config: None,
            cache_capacity: None,
            #[cfg(feature = "kvm")]
            kvm: None,
        }
    }
}

/// One introspection session: a backend, its page cache, and the event
/// registry, behind the public read/write/translate/event API.
///
/// All calls on one instance must be serialized by the caller; the
/// session performs no internal locking or threading.
pub struct Vmscope {
    backend: Backend,
    flags: InitFlags,
    info: VmInfo,
    page_mode: Cell<Option<PageMode>>,
    os: RefCell<OsProfile>,
    cache: PageCache,
    events: EventRegistry,
    destroyed: Cell<bool>,
}

impl Vmscope {
    /// Attaches to a VM.
    ///
    /// On any partial failure the state brought up so far is torn down
    /// before this returns.
    pub fn init(target: VmTarget, options: InitOptions) -> Result<Self, Error> {
        let backend = Self::open_backend(&target, &options)?;

        if options.flags.contains(InitFlags::EVENTS) && !backend.events_supported() {
            return Err(Error::NotSupported);
        }

        Self::finish(backend, options)
    }

    /// Builds a session over a caller-supplied driver.
    ///
    /// This is the seam the test suite uses; event support is taken from
    /// the driver itself.
    pub fn with_driver(driver: Box<dyn Driver>, flags: InitFlags) -> Result<Self, Error> {
        if flags.contains(InitFlags::EVENTS) && !driver.events_supported() {
            return Err(Error::NotSupported);
        }

        Self::finish(
            Backend::Custom(driver),
            InitOptions {
                flags,
                ..InitOptions::default()
            },
        )
    }

    fn open_backend(target: &VmTarget, options: &InitOptions) -> Result<Backend, Error> {
        match options.backend {
            BackendKind::Xen => Self::open_xen(target, options),
            BackendKind::Kvm => Self::open_kvm(options),
            BackendKind::File => Self::open_file(target),
            BackendKind::Auto => Self::open_xen(target, options)
                .or_else(|_| Self::open_kvm(options))
                .or_else(|_| Self::open_file(target)),
        }
    }

    #[cfg(feature = "xen")]
    fn open_xen(target: &VmTarget, options: &InitOptions) -> Result<Backend, Error> {
        use vmscope_driver_xen::XenDriver;

        let domid = match target {
            VmTarget::Id(id) => *id as u32,
            VmTarget::Name(name) => XenDriver::domid_from_name(name)?,
            VmTarget::Snapshot(_) => return Err(Error::InitFailed("snapshot target")),
        };

        if !XenDriver::probe(domid) {
            return Err(Error::InitFailed("domain not found"));
        }

        let events = options.flags.contains(InitFlags::EVENTS);
        Ok(Backend::Xen(XenDriver::new(domid, events).map_err(Error::from)?))
    }

    #[cfg(not(feature = "xen"))]
    fn open_xen(_target: &VmTarget, _options: &InitOptions) -> Result<Backend, Error> {
        Err(Error::NotSupported)
    }

    #[cfg(feature = "kvm")]
    fn open_kvm(options: &InitOptions) -> Result<Backend, Error> {
        use vmscope_driver_kvm::KvmDriver;

        let kvm = options
            .kvm
            .as_ref()
            .ok_or(Error::InitFailed("KVM connection parameters required"))?;

        if !KvmDriver::probe(kvm) {
            return Err(Error::InitFailed("monitor socket not found"));
        }

        Ok(Backend::Kvm(KvmDriver::new(kvm).map_err(Error::from)?))
    }

    #[cfg(not(feature = "kvm"))]
    fn open_kvm(_options: &InitOptions) -> Result<Backend, Error> {
        Err(Error::NotSupported)
    }

    fn open_file(target: &VmTarget) -> Result<Backend, Error> {
        use vmscope_driver_file::FileDriver;

        let path = match target {
            VmTarget::Snapshot(path) => path.clone(),
            VmTarget::Name(name) => PathBuf::from(name),
            VmTarget::Id(_) => return Err(Error::InitFailed("snapshot path required")),
        };

        if !FileDriver::probe(&path) {
            return Err(Error::InitFailed("snapshot not found"));
        }

        Ok(Backend::File(FileDriver::new(path).map_err(Error::from)?))
    }

    fn finish(backend: Backend, options: InitOptions) -> Result<Self, Error> {
        let info = backend.info()?;

        let cache_capacity = options.cache_capacity.unwrap_or(match backend.kind() {
            BackendKind::File => 0,
            _ => PageCache::DEFAULT_CAPACITY,
        });

        let vmscope = Self {
            backend,
            flags: options.flags,
            info,
            page_mode: Cell::new(None),
            os: RefCell::new(OsProfile::None),
            cache: PageCache::new(cache_capacity),
            events: EventRegistry::new(),
            destroyed: Cell::new(false),
        };

        vmscope.page_mode.set(vmscope.detect_page_mode());

        if options.flags.contains(InitFlags::COMPLETE) {
            let entry = options
                .config
                .as_ref()
                .ok_or(Error::InitFailed("configuration required for full initialization"))?;
            vmscope.detect_os(entry)?;
        }

        Ok(vmscope)
    }

    /// Derives the paging mode from vCPU 0's control state. Backends
    /// without register access (snapshots) leave it undetected.
    fn detect_page_mode(&self) -> Option<PageMode> {
        let cr0 = self.backend.vcpureg(RegisterId::Cr0, VcpuId(0)).ok()?;
        let cr4 = self.backend.vcpureg(RegisterId::Cr4, VcpuId(0)).ok()?;

        // Paravirtual contexts carry no EFER; fall back to the discovered
        // address width.
        let efer = self
            .backend
            .vcpureg(RegisterId::MsrEfer, VcpuId(0))
            .unwrap_or(if self.info.address_width == 8 { 1 << 8 } else { 0 });

        PageMode::detect(cr0, cr4, efer)
    }

    /// (Re-)detects the guest OS from a configuration entry. Offsets are
    /// otherwise frozen for the lifetime of the instance.
    pub fn detect_os(&self, entry: &ConfigEntry) -> Result<(), Error> {
        *self.os.borrow_mut() = OsProfile::from_config(entry)?;
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Accessors
    ///////////////////////////////////////////////////////////////////////

    /// The VM name.
    pub fn name(&self) -> Result<String, Error> {
        self.backend.name()
    }

    /// The backend's numeric identifier for the VM.
    pub fn id(&self) -> u64 {
        self.backend.id()
    }

    /// Resolves a VM name through the backend's directory.
    pub fn id_from_name(&self, name: &str) -> Result<u64, Error> {
        self.backend.id_from_name(name)
    }

    /// Resolves a numeric identifier to a VM name.
    pub fn name_from_id(&self, id: u64) -> Result<String, Error> {
        self.backend.name_from_id(id)
    }

    /// Total guest physical memory in bytes.
    pub fn memsize(&self) -> u64 {
        self.info.memsize
    }

    /// The number of vCPUs.
    pub fn num_vcpus(&self) -> u16 {
        self.info.vcpus
    }

    /// The guest address width in bytes (4 or 8).
    pub fn address_width(&self) -> u8 {
        self.info.address_width
    }

    /// Static VM facts discovered at initialization.
    pub fn info(&self) -> &VmInfo {
        &self.info
    }

    /// The detected paging mode, if register access allowed detection.
    pub fn page_mode(&self) -> Option<PageMode> {
        self.page_mode.get()
    }

    /// The detected guest OS family.
    pub fn ostype(&self) -> OsType {
        self.os.borrow().ostype()
    }

    /// Looks up an OS structure offset by its configuration key.
    pub fn offset(&self, name: &str) -> Option<u64> {
        self.os.borrow().offset(name)
    }

    ///////////////////////////////////////////////////////////////////////
    // Memory access
    ///////////////////////////////////////////////////////////////////////

    /// Reads guest physical memory through the page cache.
    pub fn read_pa(&self, paddr: Pa, buf: &mut [u8]) -> Result<(), Error> {
        let mut position = 0usize;
        let mut remaining = buf.len();

        while remaining > 0 {
            let address = paddr.0 + position as u64;
            let gfn = Gfn(address >> self.info.page_shift);
            let offset = (address & (self.info.page_size - 1)) as usize;

            let frame = self.cache.get_or_map(gfn, FrameProtection::Read, || {
                self.backend.map_frame(gfn, FrameProtection::Read)
            })?;

            let size = remaining.min(frame.len() - offset);
            buf[position..position + size].copy_from_slice(&frame[offset..offset + size]);

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Writes guest physical memory.
    ///
    /// The write is not atomic across pages: a failure on a later page
    /// leaves the earlier pages written. Pause the VM for multi-page
    /// consistency.
    pub fn write_pa(&self, paddr: Pa, buf: &[u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }

        self.backend.write(paddr, buf)?;

        // Copy-backed caches would otherwise serve stale bytes.
        let first = paddr.0 >> self.info.page_shift;
        let last = (paddr.0 + buf.len() as u64 - 1) >> self.info.page_shift;
        for gfn in first..=last {
            self.cache.invalidate(Gfn(gfn));
        }

        Ok(())
    }

    /// Translates a guest virtual address through the page tables rooted
    /// at `root` (an address-space identifier, e.g. a CR3 value).
    pub fn translate(&self, va: Va, root: Pa) -> Result<Pa, Error> {
        let mode = self.page_mode.get().ok_or(Error::NotSupported)?;

        let mut read = |pa: Pa, buf: &mut [u8]| self.read_pa(pa, buf);
        translate(&mut read, mode, root, va)
    }

    /// The kernel's page-table root, taken from CR3 of vCPU 0.
    pub fn kernel_root(&self) -> Result<Pa, Error> {
        Ok(Pa(self.backend.vcpureg(RegisterId::Cr3, VcpuId(0))?))
    }

    fn resolve_root(&self, space: AddressSpace) -> Result<Pa, Error> {
        match space {
            AddressSpace::Physical => Err(Error::Other("physical space has no root")),
            AddressSpace::Kernel => self.kernel_root(),
            AddressSpace::Process { root } => Ok(root),
        }
    }

    /// Reads guest memory in the given address space.
    pub fn read(&self, addr: u64, space: AddressSpace, buf: &mut [u8]) -> Result<(), Error> {
        match space {
            AddressSpace::Physical => self.read_pa(Pa(addr), buf),
            _ => self.read_va(Va(addr), self.resolve_root(space)?, buf),
        }
    }

    /// Writes guest memory in the given address space.
    pub fn write(&self, addr: u64, space: AddressSpace, buf: &[u8]) -> Result<(), Error> {
        match space {
            AddressSpace::Physical => self.write_pa(Pa(addr), buf),
            _ => self.write_va(Va(addr), self.resolve_root(space)?, buf),
        }
    }

    /// Reads guest virtual memory, translating each page separately.
    pub fn read_va(&self, va: Va, root: Pa, buf: &mut [u8]) -> Result<(), Error> {
        let mut position = 0usize;
        let mut remaining = buf.len();

        while remaining > 0 {
            let pa = self.translate(Va(va.0 + position as u64), root)?;
            let offset = pa.0 & (self.info.page_size - 1);
            let size = remaining.min((self.info.page_size - offset) as usize);

            self.read_pa(pa, &mut buf[position..position + size])?;

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Writes guest virtual memory, translating each page separately.
    pub fn write_va(&self, va: Va, root: Pa, buf: &[u8]) -> Result<(), Error> {
        let mut position = 0usize;
        let mut remaining = buf.len();

        while remaining > 0 {
            let pa = self.translate(Va(va.0 + position as u64), root)?;
            let offset = pa.0 & (self.info.page_size - 1);
            let size = remaining.min((self.info.page_size - offset) as usize);

            self.write_pa(pa, &buf[position..position + size])?;

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Reads guest memory at a Linux kernel symbol, resolved through the
    /// configured System.map.
    pub fn read_ksym(&self, symbol: &str, buf: &mut [u8]) -> Result<(), Error> {
        let sysmap = match &*self.os.borrow() {
            OsProfile::Linux {
                sysmap: Some(sysmap),
                ..
            } => sysmap.clone(),
            _ => return Err(Error::NotSupported),
        };

        let va = lookup_sysmap_symbol(&sysmap, symbol)?.ok_or(Error::NotFound)?;
        self.read_va(va, self.kernel_root()?, buf)
    }

    /// Reads an unsigned little-endian integer of 1, 2, 4, or 8 bytes.
    pub fn read_uint(&self, addr: u64, space: AddressSpace, size: usize) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        match size {
            1 | 2 | 4 | 8 => self.read(addr, space, &mut buf[..size])?,
            _ => return Err(Error::InvalidAddressWidth),
        }
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads an address-width-sized unsigned integer.
    pub fn read_addr(&self, addr: u64, space: AddressSpace) -> Result<u64, Error> {
        self.read_uint(addr, space, self.info.address_width as usize)
    }

    ///////////////////////////////////////////////////////////////////////
    // Registers and execution control
    ///////////////////////////////////////////////////////////////////////

    /// Reads one register of one vCPU.
    pub fn vcpureg(&self, reg: RegisterId, vcpu: VcpuId) -> Result<u64, Error> {
        self.backend.vcpureg(reg, vcpu)
    }

    /// Writes one register of one vCPU. Pause the VM first.
    pub fn set_vcpureg(&self, reg: RegisterId, value: u64, vcpu: VcpuId) -> Result<(), Error> {
        self.backend.set_vcpureg(reg, value, vcpu)
    }

    /// Pauses the whole VM.
    pub fn pause(&self) -> Result<(), Error> {
        self.backend.pause()
    }

    /// Resumes the VM.
    pub fn resume(&self) -> Result<(), Error> {
        self.backend.resume()
    }

    /// Pauses the VM and returns a guard that resumes it when dropped.
    pub fn pause_guard(&self) -> Result<PauseGuard<'_>, Error> {
        self.pause()?;
        Ok(PauseGuard { vmscope: self })
    }

    ///////////////////////////////////////////////////////////////////////
    // Events
    ///////////////////////////////////////////////////////////////////////

    fn events_enabled(&self) -> Result<(), Error> {
        if self.flags.contains(InitFlags::EVENTS) {
            Ok(())
        } else {
            Err(Error::NotSupported)
        }
    }

    /// Registers an event and its callback.
    pub fn register_event(&self, spec: EventSpec, callback: EventCallback) -> Result<(), Error> {
        self.events_enabled()?;

        match spec {
            EventSpec::Memory(desc) => self.events.register_mem(&self.backend, desc, callback),
            EventSpec::Register(desc) => self.events.register_reg(&self.backend, desc, callback),
            EventSpec::Singlestep(desc) => {
                self.events
                    .register_singlestep(&self.backend, desc, callback, self.info.vcpus)
            }
        }
    }

    /// Clears an event registration by its key; the access fields of the
    /// spec are ignored.
    pub fn clear_event(&self, spec: &EventSpec) -> Result<(), Error> {
        self.events_enabled()?;

        match spec {
            EventSpec::Memory(desc) => {
                self.events
                    .clear_mem(&self.backend, desc.paddr.0, desc.granularity)
            }
            EventSpec::Register(desc) => self.events.clear_reg(&self.backend, desc.reg),
            EventSpec::Singlestep(desc) => {
                self.events
                    .clear_singlestep(&self.backend, desc.vcpus, self.info.vcpus)
            }
        }
    }

    /// Blocks up to `timeout_ms` (0 = non-blocking poll) while delivering
    /// pending events to their callbacks.
    pub fn events_listen(&self, timeout_ms: u64) -> Result<(), Error> {
        self.events_enabled()?;
        self.events
            .listen(self, &self.backend, Duration::from_millis(timeout_ms))
    }

    /// The memory registration at `paddr`, if any.
    pub fn mem_event(&self, paddr: Pa, granularity: Granularity) -> Option<MemEventDesc> {
        self.events.mem_event(paddr.0, granularity)
    }

    /// The register registration on `reg`, if any.
    pub fn reg_event(&self, reg: RegisterId) -> Option<RegEventDesc> {
        self.events.reg_event(reg)
    }

    /// The single-step registration on `vcpu`, if any.
    pub fn singlestep_event(&self, vcpu: VcpuId) -> Option<SinglestepDesc> {
        self.events.singlestep_event(vcpu)
    }

    /// Stops single-stepping one vCPU and forgets its registration.
    pub fn stop_single_step_vcpu(&self, vcpu: VcpuId) -> Result<(), Error> {
        self.events_enabled()?;
        self.events.stop_singlestep_vcpu(&self.backend, vcpu)
    }

    /// Disables single-stepping on every vCPU and resets the table.
    pub fn shutdown_single_step(&self) -> Result<(), Error> {
        self.events_enabled()?;
        self.events.shutdown_singlestep(&self.backend)
    }

    ///////////////////////////////////////////////////////////////////////
    // Teardown
    ///////////////////////////////////////////////////////////////////////

    /// Tears the session down: drains the event registry (returning the
    /// hypervisor to default access) and releases every cached mapping.
    /// Idempotent; also run on drop.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }

        if self.flags.contains(InitFlags::EVENTS) {
            self.events.teardown(&self.backend);
        } else {
            self.events.set_shutting_down();
        }

        self.cache.flush();
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &EventRegistry {
        &self.events
    }
}

impl Drop for Vmscope {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Resumes the VM when dropped.
pub struct PauseGuard<'a> {
    vmscope: &'a Vmscope,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.vmscope.resume() {
            tracing::error!(?err, "failed to resume the virtual machine");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use vmscope_core::{AccessMode, GuestEvent, MemoryAccess, VcpuSet};

    use super::*;
    use crate::testutil::{MockDriver, MockProbes};

    fn session(events: bool) -> (Vmscope, MockProbes) {
        let driver = MockDriver::new(events);
        let probes = driver.probes();

        let mut flags = InitFlags::PARTIAL;
        if events {
            flags |= InitFlags::EVENTS;
        }

        let vm = Vmscope::with_driver(Box::new(driver), flags).unwrap();
        (vm, probes)
    }

    fn byte_event(paddr: u64, access: MemoryAccess) -> EventSpec {
        EventSpec::Memory(MemEventDesc {
            paddr: Pa(paddr),
            granularity: Granularity::Byte,
            access: AccessMode::Mask(access),
        })
    }

    fn page_event(paddr: u64, access: AccessMode) -> EventSpec {
        EventSpec::Memory(MemEventDesc {
            paddr: Pa(paddr),
            granularity: Granularity::Page,
            access,
        })
    }

    fn sink() -> (Rc<RefCell<Vec<GuestEvent>>>, EventCallback) {
        let seen: Rc<RefCell<Vec<GuestEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let inner = seen.clone();
        let callback: EventCallback =
            Box::new(move |_vm, event| inner.borrow_mut().push(*event));
        (seen, callback)
    }

    ///////////////////////////////////////////////////////////////////////
    // Memory round trips
    ///////////////////////////////////////////////////////////////////////

    #[test]
    fn write_then_read_round_trips() -> Result<(), Error> {
        let (vm, _) = session(false);
        let _pause = vm.pause_guard()?;

        let data = [0x11u8, 0x22, 0x33, 0x44, 0x55];
        vm.write_pa(Pa(0x1000), &data)?;

        let mut readback = [0u8; 5];
        vm.read_pa(Pa(0x1000), &mut readback)?;
        assert_eq!(readback, data);
        Ok(())
    }

    #[test]
    fn write_across_a_page_boundary_splits_at_the_boundary() -> Result<(), Error> {
        let (vm, _) = session(false);

        // 8 bytes starting 4 below the boundary: 4 land in each page.
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        vm.write_pa(Pa(0x1ffc), &data)?;

        let mut tail = [0u8; 4];
        vm.read_pa(Pa(0x1ffc), &mut tail)?;
        assert_eq!(tail, [1, 2, 3, 4]);

        let mut head = [0u8; 4];
        vm.read_pa(Pa(0x2000), &mut head)?;
        assert_eq!(head, [5, 6, 7, 8]);
        Ok(())
    }

    #[test]
    fn read_beyond_guest_ram_fails() {
        let (vm, _) = session(false);

        let mut buf = [0u8; 8];
        assert!(vm.read_pa(Pa(vm.memsize()), &mut buf).is_err());
    }

    #[test]
    fn cached_reads_see_later_writes() -> Result<(), Error> {
        let (vm, _) = session(false);

        let mut before = [0u8; 4];
        vm.read_pa(Pa(0x3000), &mut before)?; // populate the cache
        assert_eq!(before, [0, 0, 0, 0]);

        vm.write_pa(Pa(0x3000), &[9, 9, 9, 9])?;

        let mut after = [0u8; 4];
        vm.read_pa(Pa(0x3000), &mut after)?;
        assert_eq!(after, [9, 9, 9, 9]);
        Ok(())
    }

    #[test]
    fn destroy_releases_every_cached_mapping() -> Result<(), Error> {
        let (vm, probes) = session(false);

        let mut buf = [0u8; 1];
        for page in 0..8u64 {
            vm.read_pa(Pa(page << 12), &mut buf)?;
        }

        vm.destroy();
        assert_eq!(probes.frames_outstanding(), 0);
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Name resolution and registers
    ///////////////////////////////////////////////////////////////////////

    #[test]
    fn names_resolve_through_the_backend_directory() {
        let (vm, _) = session(false);

        assert_eq!(vm.id_from_name("beta").unwrap(), 12);
        assert_eq!(vm.name_from_id(7).unwrap(), "alpha");
        assert!(matches!(vm.id_from_name("gamma"), Err(Error::NotFound)));
    }

    #[test]
    fn register_round_trip_while_paused() -> Result<(), Error> {
        let (vm, probes) = session(false);

        vm.pause()?;
        assert!(probes.is_paused());

        vm.set_vcpureg(RegisterId::Rip, 0xDEAD_BEEF_0000_1000, VcpuId(0))?;
        assert_eq!(vm.vcpureg(RegisterId::Rip, VcpuId(0))?, 0xDEAD_BEEF_0000_1000);

        vm.resume()?;
        assert!(!probes.is_paused());
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Event registration
    ///////////////////////////////////////////////////////////////////////

    #[test]
    fn event_calls_require_event_initialization() {
        let (vm, _) = session(false);
        let (_, callback) = sink();

        let result = vm.register_event(byte_event(0x5000, MemoryAccess::R), callback);
        assert!(matches!(result, Err(Error::NotSupported)));
        assert!(matches!(vm.events_listen(0), Err(Error::NotSupported)));
    }

    #[test]
    fn events_flag_is_rejected_without_backend_support() {
        let driver = MockDriver::new(false);
        let result = Vmscope::with_driver(
            Box::new(driver),
            InitFlags::PARTIAL | InitFlags::EVENTS,
        );

        assert!(matches!(result, Err(Error::NotSupported)));
    }

    #[test]
    fn byte_events_combine_and_clear_back_down() -> Result<(), Error> {
        let (vm, probes) = session(true);
        let page = Pa(0x7000);
        let gfn = Gfn(0x7);

        // Byte event at +0x10 with R: the effective mask becomes R.
        let (_, cb) = sink();
        vm.register_event(byte_event(0x7010, MemoryAccess::R), cb)?;
        assert_eq!(probes.mem_access_of(gfn), Some(AccessMode::Mask(MemoryAccess::R)));

        // Byte event at +0x20 with W: the effective mask becomes RW.
        let (_, cb) = sink();
        vm.register_event(byte_event(0x7020, MemoryAccess::W), cb)?;
        assert_eq!(probes.mem_access_of(gfn), Some(AccessMode::Mask(MemoryAccess::RW)));
        assert_eq!(vm.registry().mem_mask(0x7020), Some(AccessMode::Mask(MemoryAccess::RW)));
        assert!(vm.registry().check_mask_invariant());

        // Clearing +0x10 drops the mask to W.
        vm.clear_event(&byte_event(0x7010, MemoryAccess::R))?;
        assert_eq!(probes.mem_access_of(gfn), Some(AccessMode::Mask(MemoryAccess::W)));
        assert!(vm.mem_event(Pa(0x7010), Granularity::Byte).is_none());
        assert!(vm.registry().check_mask_invariant());

        // Clearing +0x20 removes the descriptor and resets the page.
        vm.clear_event(&byte_event(0x7020, MemoryAccess::W))?;
        assert_eq!(probes.mem_access_of(gfn), None);
        assert!(vm.mem_event(page, Granularity::Byte).is_none());
        Ok(())
    }

    #[test]
    fn execute_on_write_does_not_combine() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let (_, cb) = sink();
        vm.register_event(byte_event(0x8000, MemoryAccess::R), cb)?;
        let before = probes.mem_access_of(Gfn(0x8));

        let (_, cb) = sink();
        let result = vm.register_event(page_event(0x8000, AccessMode::ExecuteOnWrite), cb);

        assert!(matches!(result, Err(Error::IncompatibleAccess)));
        assert_eq!(probes.mem_access_of(Gfn(0x8)), before);
        assert!(vm.mem_event(Pa(0x8000), Granularity::Page).is_none());
        assert!(vm.registry().check_mask_invariant());
        Ok(())
    }

    #[test]
    fn page_and_byte_events_coexist_when_combinable() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let (_, cb) = sink();
        vm.register_event(byte_event(0x9010, MemoryAccess::R), cb)?;
        let (_, cb) = sink();
        vm.register_event(page_event(0x9000, AccessMode::Mask(MemoryAccess::X)), cb)?;

        assert_eq!(probes.mem_access_of(Gfn(0x9)), Some(AccessMode::Mask(MemoryAccess::RX)));
        assert!(vm.registry().check_mask_invariant());

        // A second page-level event on the same page is a conflict.
        let (_, cb) = sink();
        let result = vm.register_event(page_event(0x9000, AccessMode::Mask(MemoryAccess::W)), cb);
        assert!(matches!(result, Err(Error::AlreadyRegistered)));

        // As is a second byte-level event at the same address.
        let (_, cb) = sink();
        let result = vm.register_event(byte_event(0x9010, MemoryAccess::W), cb);
        assert!(matches!(result, Err(Error::AlreadyRegistered)));
        Ok(())
    }

    #[test]
    fn failed_byte_clear_reinserts_the_registration() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let (_, cb) = sink();
        vm.register_event(byte_event(0xa010, MemoryAccess::R), cb)?;
        let (_, cb) = sink();
        vm.register_event(byte_event(0xa020, MemoryAccess::W), cb)?;

        probes.fail_next_set_mem_access();
        let result = vm.clear_event(&byte_event(0xa010, MemoryAccess::R));
        assert!(result.is_err());

        // The registration is back and the tables still agree with the
        // mask the hypervisor kept.
        assert!(vm.mem_event(Pa(0xa010), Granularity::Byte).is_some());
        assert_eq!(probes.mem_access_of(Gfn(0xa)), Some(AccessMode::Mask(MemoryAccess::RW)));
        assert!(vm.registry().check_mask_invariant());

        // A retry without the injected failure succeeds.
        vm.clear_event(&byte_event(0xa010, MemoryAccess::R))?;
        assert_eq!(probes.mem_access_of(Gfn(0xa)), Some(AccessMode::Mask(MemoryAccess::W)));
        Ok(())
    }

    #[test]
    fn clearing_an_unregistered_event_reports_not_found() {
        let (vm, _) = session(true);

        assert!(matches!(
            vm.clear_event(&byte_event(0xb000, MemoryAccess::R)),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            vm.clear_event(&EventSpec::Register(RegEventDesc {
                reg: RegisterId::Cr3,
                access: vmscope_core::RegAccess::W,
            })),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn duplicate_register_events_are_rejected() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let spec = EventSpec::Register(RegEventDesc {
            reg: RegisterId::Cr3,
            access: vmscope_core::RegAccess::W,
        });

        let (_, cb) = sink();
        vm.register_event(spec, cb)?;
        assert_eq!(probes.reg_access_of(RegisterId::Cr3), Some(vmscope_core::RegAccess::W));

        let (_, cb) = sink();
        let result = vm.register_event(spec, cb);
        assert!(matches!(result, Err(Error::AlreadyRegistered)));

        // The first registration stays in effect.
        assert!(vm.reg_event(RegisterId::Cr3).is_some());
        assert_eq!(probes.reg_access_of(RegisterId::Cr3), Some(vmscope_core::RegAccess::W));

        vm.clear_event(&spec)?;
        assert!(vm.reg_event(RegisterId::Cr3).is_none());
        assert_eq!(probes.reg_access_of(RegisterId::Cr3), None);
        Ok(())
    }

    #[test]
    fn single_step_registration_tracks_vcpus() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let spec = EventSpec::Singlestep(SinglestepDesc {
            vcpus: VcpuSet::all(),
        });

        let (_, cb) = sink();
        vm.register_event(spec, cb)?;
        assert_eq!(probes.stepping_vcpus(), 2);
        assert!(vm.singlestep_event(VcpuId(0)).is_some());

        vm.stop_single_step_vcpu(VcpuId(1))?;
        assert_eq!(probes.stepping_vcpus(), 1);
        assert!(vm.singlestep_event(VcpuId(1)).is_none());

        vm.shutdown_single_step()?;
        assert_eq!(probes.stepping_vcpus(), 0);
        assert!(vm.singlestep_event(VcpuId(0)).is_none());
        Ok(())
    }

    #[test]
    fn single_step_failure_on_one_vcpu_does_not_stop_the_rest() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let spec = EventSpec::Singlestep(SinglestepDesc {
            vcpus: VcpuSet::all(),
        });

        // vCPU 0 is refused by the backend; vCPU 1 still starts and the
        // set as a whole succeeds.
        probes.fail_singlestep_on(VcpuId(0));
        let (_, cb) = sink();
        vm.register_event(spec, cb)?;

        assert_eq!(probes.stepping_vcpus(), 1);
        assert!(vm.singlestep_event(VcpuId(0)).is_none());
        assert!(vm.singlestep_event(VcpuId(1)).is_some());

        // Clearing walks every vCPU even when one refuses to stop: the
        // refusal is reported, but vCPU 1 is still cleared.
        let result = vm.clear_event(&spec);
        assert!(matches!(result, Err(Error::AccessDenied)));
        assert!(vm.singlestep_event(VcpuId(1)).is_none());
        assert_eq!(probes.stepping_vcpus(), 0);

        // With the fault gone the remaining vCPU registers normally.
        probes.clear_singlestep_faults();
        let (_, cb) = sink();
        vm.register_event(spec, cb)?;
        assert_eq!(probes.stepping_vcpus(), 2);
        Ok(())
    }

    #[test]
    fn single_step_with_no_startable_vcpu_fails() {
        let (vm, probes) = session(true);

        probes.fail_singlestep_on(VcpuId(0));
        probes.fail_singlestep_on(VcpuId(1));

        let (_, cb) = sink();
        let result = vm.register_event(
            EventSpec::Singlestep(SinglestepDesc {
                vcpus: VcpuSet::all(),
            }),
            cb,
        );

        // The backend's refusal is surfaced, not masked as a conflict.
        assert!(matches!(result, Err(Error::AccessDenied)));
        assert_eq!(probes.stepping_vcpus(), 0);
        assert!(vm.singlestep_event(VcpuId(0)).is_none());
    }

    ///////////////////////////////////////////////////////////////////////
    // Delivery
    ///////////////////////////////////////////////////////////////////////

    #[test]
    fn byte_registration_wins_over_page_registration() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let (page_seen, page_cb) = sink();
        vm.register_event(page_event(0xc000, AccessMode::Mask(MemoryAccess::W)), page_cb)?;
        let (byte_seen, byte_cb) = sink();
        vm.register_event(byte_event(0xc010, MemoryAccess::W), byte_cb)?;

        // A hit on the watched byte goes to the byte callback only.
        probes.queue_event(GuestEvent::Memory {
            gpa: Pa(0xc010),
            gla: Va(0),
            gfn: Gfn(0xc),
            access: MemoryAccess::W,
            vcpu: VcpuId(0),
        });
        // A hit elsewhere in the page goes to the page callback.
        probes.queue_event(GuestEvent::Memory {
            gpa: Pa(0xc800),
            gla: Va(0),
            gfn: Gfn(0xc),
            access: MemoryAccess::W,
            vcpu: VcpuId(0),
        });

        vm.events_listen(0)?;

        assert_eq!(byte_seen.borrow().len(), 1);
        assert_eq!(page_seen.borrow().len(), 1);
        assert!(matches!(
            byte_seen.borrow()[0],
            GuestEvent::Memory { gpa: Pa(0xc010), .. }
        ));
        Ok(())
    }

    #[test]
    fn register_and_singlestep_events_reach_their_callbacks() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let (reg_seen, reg_cb) = sink();
        vm.register_event(
            EventSpec::Register(RegEventDesc {
                reg: RegisterId::Cr3,
                access: vmscope_core::RegAccess::W,
            }),
            reg_cb,
        )?;

        let (ss_seen, ss_cb) = sink();
        vm.register_event(
            EventSpec::Singlestep(SinglestepDesc {
                vcpus: VcpuSet::single(VcpuId(1)),
            }),
            ss_cb,
        )?;

        probes.queue_event(GuestEvent::Register {
            reg: RegisterId::Cr3,
            value: 0x187000,
            previous: 0x42000,
            vcpu: VcpuId(0),
        });
        probes.queue_event(GuestEvent::Singlestep {
            gla: Va(0xffff_8000_0000_0000),
            gfn: Gfn(0x1234),
            vcpu: VcpuId(1),
        });
        // An event nobody registered for is dropped quietly.
        probes.queue_event(GuestEvent::Register {
            reg: RegisterId::Cr0,
            value: 1,
            previous: 0,
            vcpu: VcpuId(0),
        });

        vm.events_listen(0)?;

        assert_eq!(reg_seen.borrow().len(), 1);
        assert_eq!(ss_seen.borrow().len(), 1);
        assert!(matches!(
            reg_seen.borrow()[0],
            GuestEvent::Register { value: 0x187000, .. }
        ));
        Ok(())
    }

    #[test]
    fn callbacks_may_use_the_session() -> Result<(), Error> {
        let (vm, probes) = session(true);
        vm.write_pa(Pa(0xd000), &[0xab])?;

        let readback: Rc<RefCell<Option<u8>>> = Rc::new(RefCell::new(None));
        let inner = readback.clone();
        let callback: EventCallback = Box::new(move |vm, _event| {
            let mut buf = [0u8; 1];
            vm.read_pa(Pa(0xd000), &mut buf).unwrap();
            *inner.borrow_mut() = Some(buf[0]);
        });

        vm.register_event(byte_event(0xd000, MemoryAccess::W), callback)?;
        probes.queue_event(GuestEvent::Memory {
            gpa: Pa(0xd000),
            gla: Va(0),
            gfn: Gfn(0xd),
            access: MemoryAccess::W,
            vcpu: VcpuId(0),
        });

        vm.events_listen(0)?;
        assert_eq!(*readback.borrow(), Some(0xab));
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Teardown
    ///////////////////////////////////////////////////////////////////////

    #[test]
    fn destroy_restores_default_access() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let (_, cb) = sink();
        vm.register_event(page_event(0xe000, AccessMode::Mask(MemoryAccess::W)), cb)?;
        let (_, cb) = sink();
        vm.register_event(byte_event(0xf010, MemoryAccess::R), cb)?;
        let (_, cb) = sink();
        vm.register_event(
            EventSpec::Register(RegEventDesc {
                reg: RegisterId::Cr3,
                access: vmscope_core::RegAccess::W,
            }),
            cb,
        )?;
        let (_, cb) = sink();
        vm.register_event(
            EventSpec::Singlestep(SinglestepDesc {
                vcpus: VcpuSet::all(),
            }),
            cb,
        )?;

        vm.destroy();

        // Every access override is back to default.
        assert_eq!(probes.mem_access_of(Gfn(0xe)), None);
        assert_eq!(probes.mem_access_of(Gfn(0xf)), None);
        assert_eq!(probes.reg_access_of(RegisterId::Cr3), None);
        assert_eq!(probes.stepping_vcpus(), 0);
        assert_eq!(probes.frames_outstanding(), 0);
        Ok(())
    }

    #[test]
    fn destroy_is_idempotent() -> Result<(), Error> {
        let (vm, probes) = session(true);

        let (_, cb) = sink();
        vm.register_event(page_event(0xe000, AccessMode::Mask(MemoryAccess::W)), cb)?;

        vm.destroy();
        vm.destroy();
        drop(vm);

        assert_eq!(probes.mem_access_of(Gfn(0xe)), None);
        Ok(())
    }
}
