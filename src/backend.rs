use std::time::Duration;

use vmscope_core::{
    AccessMode, Driver, Error, FrameProtection, Gfn, GuestEvent, MappedFrame, Pa, RegEventDesc,
    RegisterId, SinglestepDesc, VcpuId, VmInfo,
};

/// The access-mode selector passed at initialization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Probe the compiled-in backends in order.
    #[default]
    Auto,

    /// A live Xen domain.
    Xen,

    /// A live KVM guest reached through its monitor.
    Kvm,

    /// An offline snapshot file.
    File,
}

/// The backend attached to a session: one tagged variant per compiled-in
/// driver, plus an escape hatch for caller-supplied drivers (used by the
/// test suite).
pub(crate) enum Backend {
    #[cfg(feature = "xen")]
    Xen(vmscope_driver_xen::XenDriver),

    #[cfg(feature = "kvm")]
    Kvm(vmscope_driver_kvm::KvmDriver),

    File(vmscope_driver_file::FileDriver),

    Custom(Box<dyn Driver>),
}

impl Backend {
    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            #[cfg(feature = "xen")]
            Self::Xen(_) => BackendKind::Xen,
            #[cfg(feature = "kvm")]
            Self::Kvm(_) => BackendKind::Kvm,
            Self::File(_) => BackendKind::File,
            Self::Custom(_) => BackendKind::Auto,
        }
    }

    fn driver(&self) -> &dyn Driver {
        match self {
            #[cfg(feature = "xen")]
            Self::Xen(driver) => driver,
            #[cfg(feature = "kvm")]
            Self::Kvm(driver) => driver,
            Self::File(driver) => driver,
            Self::Custom(driver) => driver.as_ref(),
        }
    }
}

impl Driver for Backend {
    fn info(&self) -> Result<VmInfo, Error> {
        self.driver().info()
    }

    fn id(&self) -> u64 {
        self.driver().id()
    }

    fn name(&self) -> Result<String, Error> {
        self.driver().name()
    }

    fn id_from_name(&self, name: &str) -> Result<u64, Error> {
        self.driver().id_from_name(name)
    }

    fn name_from_id(&self, id: u64) -> Result<String, Error> {
        self.driver().name_from_id(id)
    }

    fn map_frame(&self, gfn: Gfn, protection: FrameProtection) -> Result<MappedFrame, Error> {
        self.driver().map_frame(gfn, protection)
    }

    fn write(&self, paddr: Pa, buf: &[u8]) -> Result<(), Error> {
        self.driver().write(paddr, buf)
    }

    fn vcpureg(&self, reg: RegisterId, vcpu: VcpuId) -> Result<u64, Error> {
        self.driver().vcpureg(reg, vcpu)
    }

    fn set_vcpureg(&self, reg: RegisterId, value: u64, vcpu: VcpuId) -> Result<(), Error> {
        self.driver().set_vcpureg(reg, value, vcpu)
    }

    fn pause(&self) -> Result<(), Error> {
        self.driver().pause()
    }

    fn resume(&self) -> Result<(), Error> {
        self.driver().resume()
    }

    fn events_supported(&self) -> bool {
        self.driver().events_supported()
    }

    fn set_reg_access(&self, desc: &RegEventDesc) -> Result<(), Error> {
        self.driver().set_reg_access(desc)
    }

    fn set_mem_access(&self, gfn: Gfn, access: AccessMode) -> Result<(), Error> {
        self.driver().set_mem_access(gfn, access)
    }

    fn start_single_step(&self, desc: &SinglestepDesc) -> Result<(), Error> {
        self.driver().start_single_step(desc)
    }

    fn stop_single_step(&self, vcpu: VcpuId) -> Result<(), Error> {
        self.driver().stop_single_step(vcpu)
    }

    fn shutdown_single_step(&self) -> Result<(), Error> {
        self.driver().shutdown_single_step()
    }

    fn listen(&self, timeout: Duration, sink: &mut dyn FnMut(&GuestEvent)) -> Result<(), Error> {
        self.driver().listen(timeout, sink)
    }
}
