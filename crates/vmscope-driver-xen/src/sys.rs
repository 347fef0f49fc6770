//! Runtime bindings to the Xen control libraries.
//!
//! The control, event-channel, and xenstore libraries are loaded with
//! `dlopen` at initialization rather than linked, so the crate builds and
//! its tests run on hosts without a Xen toolstack. Handles returned by the
//! libraries are owned by the wrapper types below and released in `Drop`.

use std::{
    ffi::{c_char, c_int, c_uint, c_ulong, c_void, CString},
    os::fd::RawFd,
};

use libloading::Library;

use crate::Error;

const LIBXENCTRL: &[&str] = &["libxenctrl.so", "libxenctrl.so.4.17", "libxenctrl.so.4.16"];
const LIBXENEVTCHN: &[&str] = &["libxenevtchn.so", "libxenevtchn.so.1"];
const LIBXENSTORE: &[&str] = &["libxenstore.so", "libxenstore.so.4", "libxenstore.so.3.0"];

/// The `XEN_DOMCTL_get_address_size` command number.
const XEN_DOMCTL_GET_ADDRESS_SIZE: u32 = 36;
const XEN_DOMCTL_INTERFACE_VERSION: u32 = 0x15;

/// `XEN_DOMCTL_DEBUG_OP_*` single-step toggles.
pub const DEBUG_OP_SINGLE_STEP_ON: u32 = 1;
pub const DEBUG_OP_SINGLE_STEP_OFF: u32 = 2;

/// The HVM save-record type code for the CPU context.
pub const HVM_SAVE_CODE_CPU: u16 = 2;

fn load_first(names: &'static [&'static str]) -> Result<Library, Error> {
    for name in names {
        // SAFETY: Loading a Xen toolstack library runs only its init
        // sections; the libraries are regular system libraries.
        if let Ok(library) = unsafe { Library::new(name) } {
            return Ok(library);
        }
    }
    Err(Error::LibraryNotFound(names[0]))
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        // SAFETY: The symbol type is the documented C prototype.
        *unsafe { $lib.get(concat!($name, "\0").as_bytes()) }
            .map_err(|_| Error::SymbolNotFound($name))?
    };
}

///////////////////////////////////////////////////////////////////////////////
// xenctrl
///////////////////////////////////////////////////////////////////////////////

/// Domain facts returned by `xc_domain_getinfo`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct XcDomInfo {
    pub domid: u32,
    pub ssidref: u32,
    pub flags: u32,
    pub nr_pages: u64,
    pub nr_shared_pages: u64,
    pub nr_paged_pages: u64,
    pub shared_info_frame: u64,
    pub cpu_time: u64,
    pub max_memkb: u64,
    pub nr_online_vcpus: u32,
    pub max_vcpu_id: u32,
    pub handle: [u8; 16],
    pub cpupool: u32,
}

impl XcDomInfo {
    const FLAG_HVM: u32 = 1 << 5;

    /// Whether the domain runs under hardware virtualization.
    pub fn hvm(&self) -> bool {
        self.flags & Self::FLAG_HVM != 0
    }
}

#[repr(C)]
struct XenDomctl {
    cmd: u32,
    interface_version: u32,
    domain: u32,
    _pad: u32,
    data: [u64; 16],
}

/// A handle to the Xen control interface.
pub struct XenControl {
    xc_interface_close: extern "C" fn(*mut c_void) -> c_int,
    xc_domain_getinfo: extern "C" fn(*mut c_void, u32, c_uint, *mut XcDomInfo) -> c_int,
    xc_domain_pause: extern "C" fn(*mut c_void, u32) -> c_int,
    xc_domain_unpause: extern "C" fn(*mut c_void, u32) -> c_int,
    xc_map_foreign_range: extern "C" fn(*mut c_void, u32, c_int, c_int, c_ulong) -> *mut c_void,
    xc_domain_hvm_getcontext: extern "C" fn(*mut c_void, u32, *mut u8, u32) -> c_int,
    xc_domain_hvm_getcontext_partial:
        extern "C" fn(*mut c_void, u32, u16, u16, *mut c_void, u32) -> c_int,
    xc_domain_hvm_setcontext: extern "C" fn(*mut c_void, u32, *mut u8, u32) -> c_int,
    xc_vcpu_getcontext: extern "C" fn(*mut c_void, u32, u32, *mut VcpuGuestContextAny) -> c_int,
    xc_vcpu_setcontext: extern "C" fn(*mut c_void, u32, u32, *mut VcpuGuestContextAny) -> c_int,
    xc_domctl: extern "C" fn(*mut c_void, *mut XenDomctl) -> c_int,
    xc_domain_debug_control: extern "C" fn(*mut c_void, u32, u32, u32) -> c_int,
    xc_set_mem_access: extern "C" fn(*mut c_void, u32, u32, u64, u32) -> c_int,
    xc_monitor_enable: extern "C" fn(*mut c_void, u32, *mut u32) -> *mut c_void,
    xc_monitor_disable: extern "C" fn(*mut c_void, u32) -> c_int,
    xc_monitor_write_ctrlreg: extern "C" fn(*mut c_void, u32, u16, u8, u8, u8) -> c_int,
    xc_monitor_mov_to_msr: extern "C" fn(*mut c_void, u32, u32, u8) -> c_int,
    xc_monitor_singlestep: extern "C" fn(*mut c_void, u32, u8) -> c_int,

    handle: *mut c_void,
    _library: Library,
}

impl XenControl {
    /// Loads the control library and opens an interface handle.
    pub fn open() -> Result<Self, Error> {
        let library = load_first(LIBXENCTRL)?;

        let xc_interface_open: extern "C" fn(*mut c_void, *mut c_void, c_uint) -> *mut c_void =
            resolve!(library, "xc_interface_open");

        // Resolve everything before opening the handle so a missing symbol
        // cannot leak an open interface.
        let mut control = Self {
            xc_interface_close: resolve!(library, "xc_interface_close"),
            xc_domain_getinfo: resolve!(library, "xc_domain_getinfo"),
            xc_domain_pause: resolve!(library, "xc_domain_pause"),
            xc_domain_unpause: resolve!(library, "xc_domain_unpause"),
            xc_map_foreign_range: resolve!(library, "xc_map_foreign_range"),
            xc_domain_hvm_getcontext: resolve!(library, "xc_domain_hvm_getcontext"),
            xc_domain_hvm_getcontext_partial: resolve!(
                library,
                "xc_domain_hvm_getcontext_partial"
            ),
            xc_domain_hvm_setcontext: resolve!(library, "xc_domain_hvm_setcontext"),
            xc_vcpu_getcontext: resolve!(library, "xc_vcpu_getcontext"),
            xc_vcpu_setcontext: resolve!(library, "xc_vcpu_setcontext"),
            xc_domctl: resolve!(library, "xc_domctl"),
            xc_domain_debug_control: resolve!(library, "xc_domain_debug_control"),
            xc_set_mem_access: resolve!(library, "xc_set_mem_access"),
            xc_monitor_enable: resolve!(library, "xc_monitor_enable"),
            xc_monitor_disable: resolve!(library, "xc_monitor_disable"),
            xc_monitor_write_ctrlreg: resolve!(library, "xc_monitor_write_ctrlreg"),
            xc_monitor_mov_to_msr: resolve!(library, "xc_monitor_mov_to_msr"),
            xc_monitor_singlestep: resolve!(library, "xc_monitor_singlestep"),
            handle: std::ptr::null_mut(),
            _library: library,
        };

        control.handle = xc_interface_open(std::ptr::null_mut(), std::ptr::null_mut(), 0);
        if control.handle.is_null() {
            return Err(Error::InterfaceOpen);
        }

        Ok(control)
    }

    /// Fetches domain facts for exactly `domid`.
    pub fn domain_info(&self, domid: u32) -> Result<XcDomInfo, Error> {
        let mut info = XcDomInfo::default();
        let rc = (self.xc_domain_getinfo)(self.handle, domid, 1, &mut info);

        if rc != 1 || info.domid != domid {
            return Err(Error::DomainNotFound(domid));
        }
        Ok(info)
    }

    pub fn pause(&self, domid: u32) -> Result<(), Error> {
        match (self.xc_domain_pause)(self.handle, domid) {
            0 => Ok(()),
            _ => Err(Error::Control("xc_domain_pause")),
        }
    }

    pub fn unpause(&self, domid: u32) -> Result<(), Error> {
        match (self.xc_domain_unpause)(self.handle, domid) {
            0 => Ok(()),
            _ => Err(Error::Control("xc_domain_unpause")),
        }
    }

    /// Maps one guest frame into this process.
    pub fn map_foreign_page(
        &self,
        domid: u32,
        pfn: u64,
        prot: c_int,
    ) -> Result<ForeignMapping, Error> {
        let length = 0x1000usize;
        let ptr = (self.xc_map_foreign_range)(self.handle, domid, length as c_int, prot, pfn as c_ulong);

        if ptr.is_null() || ptr == libc::MAP_FAILED {
            return Err(Error::MapFailed(pfn));
        }

        Ok(ForeignMapping { ptr, length })
    }

    /// Fetches the partial HVM CPU save record of one vCPU.
    pub fn hvm_context_partial(&self, domid: u32, vcpu: u16) -> Result<HvmHwCpu, Error> {
        let mut cpu = HvmHwCpu::new_zeroed();
        let rc = (self.xc_domain_hvm_getcontext_partial)(
            self.handle,
            domid,
            HVM_SAVE_CODE_CPU,
            vcpu,
            &mut cpu as *mut _ as *mut c_void,
            std::mem::size_of::<HvmHwCpu>() as u32,
        );

        if rc != 0 {
            return Err(Error::Control("xc_domain_hvm_getcontext_partial"));
        }
        Ok(cpu)
    }

    /// Fetches the full HVM context blob.
    pub fn hvm_context(&self, domid: u32) -> Result<Vec<u8>, Error> {
        let size =
            (self.xc_domain_hvm_getcontext)(self.handle, domid, std::ptr::null_mut(), 0);
        if size <= 0 {
            return Err(Error::Control("xc_domain_hvm_getcontext (size)"));
        }

        let mut buf = vec![0u8; size as usize];
        let rc =
            (self.xc_domain_hvm_getcontext)(self.handle, domid, buf.as_mut_ptr(), size as u32);
        if rc < 0 {
            return Err(Error::Control("xc_domain_hvm_getcontext"));
        }

        Ok(buf)
    }

    /// Stores a patched HVM context blob back into the domain.
    pub fn set_hvm_context(&self, domid: u32, buf: &mut [u8]) -> Result<(), Error> {
        let rc = (self.xc_domain_hvm_setcontext)(
            self.handle,
            domid,
            buf.as_mut_ptr(),
            buf.len() as u32,
        );

        if rc != 0 {
            return Err(Error::Control("xc_domain_hvm_setcontext"));
        }
        Ok(())
    }

    /// Fetches the PV guest context of one vCPU.
    pub fn vcpu_context(&self, domid: u32, vcpu: u32) -> Result<VcpuGuestContextAny, Error> {
        // SAFETY: The context is plain old data; all-zeroes is a valid value.
        let mut ctx: VcpuGuestContextAny = unsafe { std::mem::zeroed() };
        let rc = (self.xc_vcpu_getcontext)(self.handle, domid, vcpu, &mut ctx);

        if rc != 0 {
            return Err(Error::Control("xc_vcpu_getcontext"));
        }
        Ok(ctx)
    }

    /// Stores a patched PV guest context back into the domain.
    pub fn set_vcpu_context(
        &self,
        domid: u32,
        vcpu: u32,
        ctx: &mut VcpuGuestContextAny,
    ) -> Result<(), Error> {
        let rc = (self.xc_vcpu_setcontext)(self.handle, domid, vcpu, ctx);

        if rc != 0 {
            return Err(Error::Control("xc_vcpu_setcontext"));
        }
        Ok(())
    }

    /// Issues `XEN_DOMCTL_get_address_size` and returns the size in bits.
    pub fn address_size(&self, domid: u32) -> Result<u32, Error> {
        let mut domctl = XenDomctl {
            cmd: XEN_DOMCTL_GET_ADDRESS_SIZE,
            interface_version: XEN_DOMCTL_INTERFACE_VERSION,
            domain: domid,
            _pad: 0,
            data: [0; 16],
        };

        let rc = (self.xc_domctl)(self.handle, &mut domctl);
        if rc != 0 {
            return Err(Error::Control("XEN_DOMCTL_get_address_size"));
        }

        Ok(domctl.data[0] as u32)
    }

    /// Toggles single-stepping of one vCPU.
    pub fn debug_control(&self, domid: u32, op: u32, vcpu: u32) -> Result<(), Error> {
        match (self.xc_domain_debug_control)(self.handle, domid, op, vcpu) {
            0 => Ok(()),
            _ => Err(Error::Control("xc_domain_debug_control")),
        }
    }

    /// Programs the hypervisor access permitted on a range of frames.
    pub fn set_mem_access(&self, domid: u32, access: u32, first_pfn: u64, nr: u32) -> Result<(), Error> {
        match (self.xc_set_mem_access)(self.handle, domid, access, first_pfn, nr) {
            0 => Ok(()),
            _ => Err(Error::Control("xc_set_mem_access")),
        }
    }

    /// Enables the monitor ring and returns its shared page and event port.
    pub fn monitor_enable(&self, domid: u32) -> Result<(ForeignMapping, u32), Error> {
        let mut port = 0u32;
        let ptr = (self.xc_monitor_enable)(self.handle, domid, &mut port);

        if ptr.is_null() || ptr == libc::MAP_FAILED {
            return Err(Error::Control("xc_monitor_enable"));
        }

        Ok((
            ForeignMapping {
                ptr,
                length: 0x1000,
            },
            port,
        ))
    }

    pub fn monitor_disable(&self, domid: u32) -> Result<(), Error> {
        match (self.xc_monitor_disable)(self.handle, domid) {
            0 => Ok(()),
            _ => Err(Error::Control("xc_monitor_disable")),
        }
    }

    /// Enables or disables trapping of writes to a control register.
    pub fn monitor_write_ctrlreg(
        &self,
        domid: u32,
        index: u16,
        enable: bool,
        sync: bool,
        onchangeonly: bool,
    ) -> Result<(), Error> {
        let rc = (self.xc_monitor_write_ctrlreg)(
            self.handle,
            domid,
            index,
            enable as u8,
            sync as u8,
            onchangeonly as u8,
        );

        match rc {
            0 => Ok(()),
            _ => Err(Error::Control("xc_monitor_write_ctrlreg")),
        }
    }

    /// Enables or disables trapping of writes to an MSR.
    pub fn monitor_mov_to_msr(&self, domid: u32, msr: u32, enable: bool) -> Result<(), Error> {
        match (self.xc_monitor_mov_to_msr)(self.handle, domid, msr, enable as u8) {
            0 => Ok(()),
            _ => Err(Error::Control("xc_monitor_mov_to_msr")),
        }
    }

    /// Enables or disables single-step event generation domain-wide.
    pub fn monitor_singlestep(&self, domid: u32, enable: bool) -> Result<(), Error> {
        match (self.xc_monitor_singlestep)(self.handle, domid, enable as u8) {
            0 => Ok(()),
            _ => Err(Error::Control("xc_monitor_singlestep")),
        }
    }
}

impl Drop for XenControl {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            (self.xc_interface_close)(self.handle);
        }
    }
}

/// A foreign-memory mapping, unmapped on drop.
pub struct ForeignMapping {
    ptr: *mut c_void,
    length: usize,
}

impl ForeignMapping {
    /// The raw page pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }
}

impl std::ops::Deref for ForeignMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: The mapping stays valid until drop.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.length) }
    }
}

impl std::ops::DerefMut for ForeignMapping {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: The mapping stays valid until drop and is private to us.
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.length) }
    }
}

impl Drop for ForeignMapping {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from a successful map of `length` bytes.
        unsafe {
            libc::munmap(self.ptr, self.length);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Event channels
///////////////////////////////////////////////////////////////////////////////

/// A bound inter-domain event channel.
pub struct EventChannel {
    xenevtchn_close: extern "C" fn(*mut c_void) -> c_int,
    xenevtchn_fd: extern "C" fn(*mut c_void) -> c_int,
    xenevtchn_pending: extern "C" fn(*mut c_void) -> c_int,
    xenevtchn_unmask: extern "C" fn(*mut c_void, u32) -> c_int,
    xenevtchn_notify: extern "C" fn(*mut c_void, u32) -> c_int,

    handle: *mut c_void,
    local_port: u32,
    _library: Library,
}

impl EventChannel {
    /// Opens the event-channel interface and binds to a remote port.
    pub fn bind(domid: u32, remote_port: u32) -> Result<Self, Error> {
        let library = load_first(LIBXENEVTCHN)?;

        let xenevtchn_open: extern "C" fn(*mut c_void, c_uint) -> *mut c_void =
            resolve!(library, "xenevtchn_open");
        let xenevtchn_bind_interdomain: extern "C" fn(*mut c_void, u32, u32) -> c_int =
            resolve!(library, "xenevtchn_bind_interdomain");

        let mut channel = Self {
            xenevtchn_close: resolve!(library, "xenevtchn_close"),
            xenevtchn_fd: resolve!(library, "xenevtchn_fd"),
            xenevtchn_pending: resolve!(library, "xenevtchn_pending"),
            xenevtchn_unmask: resolve!(library, "xenevtchn_unmask"),
            xenevtchn_notify: resolve!(library, "xenevtchn_notify"),
            handle: std::ptr::null_mut(),
            local_port: 0,
            _library: library,
        };

        channel.handle = xenevtchn_open(std::ptr::null_mut(), 0);
        if channel.handle.is_null() {
            return Err(Error::Control("xenevtchn_open"));
        }

        let local_port = xenevtchn_bind_interdomain(channel.handle, domid, remote_port);
        if local_port < 0 {
            return Err(Error::Control("xenevtchn_bind_interdomain"));
        }

        channel.local_port = local_port as u32;
        Ok(channel)
    }

    /// The pollable file descriptor.
    pub fn fd(&self) -> RawFd {
        (self.xenevtchn_fd)(self.handle)
    }

    /// Consumes one pending notification and unmasks the port.
    pub fn acknowledge(&self) -> Result<(), Error> {
        let port = (self.xenevtchn_pending)(self.handle);
        if port < 0 {
            return Err(Error::Control("xenevtchn_pending"));
        }

        match (self.xenevtchn_unmask)(self.handle, port as u32) {
            0 => Ok(()),
            _ => Err(Error::Control("xenevtchn_unmask")),
        }
    }

    /// Kicks the hypervisor side of the channel.
    pub fn notify(&self) -> Result<(), Error> {
        match (self.xenevtchn_notify)(self.handle, self.local_port) {
            0 => Ok(()),
            _ => Err(Error::Control("xenevtchn_notify")),
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            (self.xenevtchn_close)(self.handle);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Xenstore
///////////////////////////////////////////////////////////////////////////////

/// A xenstore connection for domain-name resolution.
pub struct Xenstore {
    xs_close: extern "C" fn(*mut c_void),
    xs_directory:
        extern "C" fn(*mut c_void, u32, *const c_char, *mut c_uint) -> *mut *mut c_char,
    xs_read: extern "C" fn(*mut c_void, u32, *const c_char, *mut c_uint) -> *mut c_void,

    handle: *mut c_void,
    _library: Library,
}

impl Xenstore {
    /// Opens the xenstore daemon connection.
    pub fn open() -> Result<Self, Error> {
        let library = load_first(LIBXENSTORE)?;

        let xs_open: extern "C" fn(c_ulong) -> *mut c_void = resolve!(library, "xs_open");

        let mut store = Self {
            xs_close: resolve!(library, "xs_close"),
            xs_directory: resolve!(library, "xs_directory"),
            xs_read: resolve!(library, "xs_read"),
            handle: std::ptr::null_mut(),
            _library: library,
        };

        store.handle = xs_open(0);
        if store.handle.is_null() {
            return Err(Error::Control("xs_open"));
        }

        Ok(store)
    }

    /// Lists the children of a xenstore path.
    pub fn directory(&self, path: &str) -> Result<Vec<String>, Error> {
        let path = CString::new(path).map_err(|_| Error::Control("xs_directory path"))?;
        let mut num: c_uint = 0;

        let entries = (self.xs_directory)(self.handle, 0, path.as_ptr(), &mut num);
        if entries.is_null() {
            return Err(Error::Control("xs_directory"));
        }

        let mut result = Vec::with_capacity(num as usize);
        for i in 0..num as usize {
            // SAFETY: xs_directory returns `num` valid C strings.
            let entry = unsafe { std::ffi::CStr::from_ptr(*entries.add(i)) };
            result.push(entry.to_string_lossy().into_owned());
        }

        // SAFETY: The vector of pointers is a single malloc'd block.
        unsafe { libc::free(entries as *mut c_void) };
        Ok(result)
    }

    /// Reads one xenstore value.
    pub fn read(&self, path: &str) -> Option<String> {
        let path = CString::new(path).ok()?;
        let mut len: c_uint = 0;

        let value = (self.xs_read)(self.handle, 0, path.as_ptr(), &mut len);
        if value.is_null() {
            return None;
        }

        // SAFETY: xs_read returns `len` bytes of malloc'd data.
        let bytes =
            unsafe { std::slice::from_raw_parts(value as *const u8, len as usize) }.to_vec();
        unsafe { libc::free(value) };

        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Drop for Xenstore {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            (self.xs_close)(self.handle);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// CPU save records
///////////////////////////////////////////////////////////////////////////////

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The descriptor preceding each record in the full HVM context blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct HvmSaveDescriptor {
    pub typecode: u16,
    pub instance: u16,
    pub length: u32,
}

/// The HVM CPU save record.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct HvmHwCpu {
    pub fpu_regs: [u8; 512],

    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub cs_sel: u32,
    pub ds_sel: u32,
    pub es_sel: u32,
    pub fs_sel: u32,
    pub gs_sel: u32,
    pub ss_sel: u32,
    pub tr_sel: u32,
    pub ldtr_sel: u32,

    pub cs_limit: u32,
    pub ds_limit: u32,
    pub es_limit: u32,
    pub fs_limit: u32,
    pub gs_limit: u32,
    pub ss_limit: u32,
    pub tr_limit: u32,
    pub ldtr_limit: u32,
    pub idtr_limit: u32,
    pub gdtr_limit: u32,

    pub cs_base: u64,
    pub ds_base: u64,
    pub es_base: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ss_base: u64,
    pub tr_base: u64,
    pub ldtr_base: u64,
    pub idtr_base: u64,
    pub gdtr_base: u64,

    pub cs_arbytes: u32,
    pub ds_arbytes: u32,
    pub es_arbytes: u32,
    pub fs_arbytes: u32,
    pub gs_arbytes: u32,
    pub ss_arbytes: u32,
    pub tr_arbytes: u32,
    pub ldtr_arbytes: u32,

    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub shadow_gs: u64,

    pub msr_flags: u64,
    pub msr_lstar: u64,
    pub msr_star: u64,
    pub msr_cstar: u64,
    pub msr_syscall_mask: u64,
    pub msr_efer: u64,
    pub msr_tsc_aux: u64,

    pub tsc: u64,

    pub pending_event: u32,
    pub error_code: u32,
}

impl HvmHwCpu {
    /// An all-zero record.
    pub fn new_zeroed() -> Self {
        zerocopy::FromZeros::new_zeroed()
    }
}

/// The PV user-register block, 64-bit layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuUserRegsX64 {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub error_code: u32,
    pub entry_vector: u32,
    pub rip: u64,
    pub cs: u16,
    pub _pad0: [u16; 1],
    pub saved_upcall_mask: u8,
    pub _pad1: [u8; 3],
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u16,
    pub _pad2: [u16; 3],
    pub es: u16,
    pub _pad3: [u16; 3],
    pub ds: u16,
    pub _pad4: [u16; 3],
    pub fs: u16,
    pub _pad5: [u16; 3],
    pub gs: u16,
    pub _pad6: [u16; 3],
}

/// The PV guest context, 64-bit layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VcpuGuestContextX64 {
    pub fpu_ctxt: [u8; 512],
    pub flags: u64,
    pub user_regs: CpuUserRegsX64,
    pub trap_ctxt: [u8; 4096],
    pub ldt_base: u64,
    pub ldt_ents: u64,
    pub gdt_frames: [u64; 16],
    pub gdt_ents: u64,
    pub kernel_ss: u64,
    pub kernel_sp: u64,
    pub ctrlreg: [u64; 8],
    pub debugreg: [u64; 8],
    pub event_callback_eip: u64,
    pub failsafe_callback_eip: u64,
    pub syscall_callback_eip: u64,
    pub vm_assist: u64,
    pub fs_base: u64,
    pub gs_base_kernel: u64,
    pub gs_base_user: u64,
}

/// The PV user-register block, 32-bit layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuUserRegsX32 {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub error_code: u16,
    pub entry_vector: u16,
    pub eip: u32,
    pub cs: u16,
    pub saved_upcall_mask: u8,
    pub _pad0: u8,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    pub _pad1: u16,
    pub es: u16,
    pub _pad2: u16,
    pub ds: u16,
    pub _pad3: u16,
    pub fs: u16,
    pub _pad4: u16,
    pub gs: u16,
    pub _pad5: u16,
}

/// The PV guest context, 32-bit layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VcpuGuestContextX32 {
    pub fpu_ctxt: [u8; 512],
    pub flags: u32,
    pub user_regs: CpuUserRegsX32,
    pub trap_ctxt: [u8; 2048],
    pub ldt_base: u32,
    pub ldt_ents: u32,
    pub gdt_frames: [u32; 16],
    pub gdt_ents: u32,
    pub kernel_ss: u32,
    pub kernel_sp: u32,
    pub ctrlreg: [u32; 8],
    pub debugreg: [u32; 8],
    pub event_callback_cs: u32,
    pub event_callback_eip: u32,
    pub failsafe_callback_cs: u32,
    pub failsafe_callback_eip: u32,
    pub vm_assist: u32,
}

/// The width-overlaid PV context passed to the context hypercalls.
#[repr(C)]
pub union VcpuGuestContextAny {
    /// 64-bit layout.
    pub x64: VcpuGuestContextX64,

    /// 32-bit layout.
    pub x32: VcpuGuestContextX32,
}

/// Encodes a page frame number into the PV CR3 format.
pub fn pfn_to_cr3(pfn: u64, address_width: u8) -> u64 {
    match address_width {
        8 => pfn << 12,
        // PAE packs the top bits of the PFN into the low bits.
        _ => ((pfn as u32) << 12 | (pfn as u32) >> 20) as u64,
    }
}

/// Decodes the PV CR3 format back into a page frame number.
pub fn cr3_to_pfn(cr3: u64, address_width: u8) -> u64 {
    match address_width {
        8 => cr3 >> 12,
        _ => ((cr3 as u32) >> 12 | (cr3 as u32) << 20) as u64,
    }
}
