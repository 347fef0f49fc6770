use std::{cell::RefCell, os::unix::fs::FileTypeExt, path::PathBuf};

use serde_json::Value;
use vmscope_core::{
    Driver, Error as VmiError, FrameProtection, Gfn, MappedFrame, Pa, RegisterId, VcpuId, VmInfo,
};
use vmscope_arch_amd64::{efer_long_mode, Registers, PAGE_SHIFT, PAGE_SIZE};

use crate::{gdb::GdbClient, pmem::PmemClient, qmp::QmpClient, regs, Error};

/// Which physical-memory channel the driver should use.
///
/// The patched-monitor channel is faster; the GDB stub works against a
/// stock monitor but is slower. `Auto` prefers the patched path and falls
/// back to the stub.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum KvmMemoryPath {
    /// Prefer the patched monitor, fall back to the GDB stub.
    #[default]
    Auto,

    /// Require the patched-monitor channel.
    Monitor,

    /// Require the GDB stub.
    GdbStub,
}

/// Connection parameters for a KVM guest.
#[derive(Debug, Clone)]
pub struct KvmOptions {
    /// Path to the monitor's QMP socket.
    pub monitor_socket: PathBuf,

    /// Address of the GDB stub (`host:port`), if one is exposed.
    pub gdb_addr: Option<String>,

    /// Memory channel selection.
    pub memory_path: KvmMemoryPath,

    /// Numeric identifier assigned by the caller (the monitor has none).
    pub id: u64,
}

enum MemoryChannel {
    Monitor(PmemClient),
    Gdb(GdbClient),
}

/// Backend over a live KVM guest's monitor.
pub struct KvmDriver {
    qmp: RefCell<QmpClient>,
    memory: RefCell<MemoryChannel>,
    name: String,
    id: u64,
    vcpus: u16,
    memsize: u64,
}

impl KvmDriver {
    /// Checks whether the monitor socket looks usable.
    pub fn probe(options: &KvmOptions) -> bool {
        options
            .monitor_socket
            .metadata()
            .map(|m| m.file_type().is_socket())
            .unwrap_or(false)
    }

    /// Connects to the monitor and brings up a memory channel.
    pub fn new(options: &KvmOptions) -> Result<Self, Error> {
        let mut qmp = QmpClient::connect(&options.monitor_socket)?;

        let name = qmp
            .execute("query-name", None)
            .ok()
            .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();

        let memsize = Self::query_memsize(&mut qmp);
        let vcpus = Self::query_vcpus(&mut qmp);

        let memory = Self::open_memory_channel(&mut qmp, options, &name)?;

        Ok(Self {
            qmp: RefCell::new(qmp),
            memory: RefCell::new(memory),
            name,
            id: options.id,
            vcpus,
            memsize,
        })
    }

    fn query_memsize(qmp: &mut QmpClient) -> u64 {
        if let Ok(reply) = qmp.execute("query-memory-size-summary", None) {
            if let Some(size) = reply.get("base-memory").and_then(Value::as_u64) {
                return size;
            }
        }

        qmp.execute("query-balloon", None)
            .ok()
            .and_then(|v| v.get("actual").and_then(Value::as_u64))
            .unwrap_or(0)
    }

    fn query_vcpus(qmp: &mut QmpClient) -> u16 {
        for command in ["query-cpus-fast", "query-cpus"] {
            if let Ok(Value::Array(cpus)) = qmp.execute(command, None) {
                return cpus.len() as u16;
            }
        }
        1
    }

    fn open_memory_channel(
        qmp: &mut QmpClient,
        options: &KvmOptions,
        name: &str,
    ) -> Result<MemoryChannel, Error> {
        let monitor = |qmp: &mut QmpClient| -> Result<MemoryChannel, Error> {
            let socket = std::env::temp_dir().join(format!(
                "vmscope-pmem-{}-{}",
                std::process::id(),
                if name.is_empty() { "vm" } else { name }
            ));

            qmp.hmp(&format!("pmemaccess {}", socket.display()))?;
            Ok(MemoryChannel::Monitor(PmemClient::connect(&socket)?))
        };

        let gdb = |options: &KvmOptions| -> Result<MemoryChannel, Error> {
            let addr = options.gdb_addr.as_deref().ok_or(Error::NotSupported)?;
            Ok(MemoryChannel::Gdb(GdbClient::connect(addr)?))
        };

        match options.memory_path {
            KvmMemoryPath::Monitor => monitor(qmp),
            KvmMemoryPath::GdbStub => gdb(options),
            KvmMemoryPath::Auto => monitor(qmp).or_else(|err| {
                tracing::debug!(?err, "patched monitor channel unavailable, trying gdb stub");
                gdb(options)
            }),
        }
    }

    fn registers(&self, vcpu: VcpuId) -> Result<Registers, Error> {
        let mut qmp = self.qmp.borrow_mut();

        if self.vcpus > 1 {
            qmp.hmp(&format!("cpu {}", vcpu.0))?;
        }

        let text = qmp.hmp("info registers")?;
        Ok(regs::parse_info_registers(&text))
    }
}

impl Driver for KvmDriver {
    fn info(&self) -> Result<VmInfo, VmiError> {
        let address_width = match self.registers(VcpuId(0)) {
            Ok(regs) if !efer_long_mode(regs.msr_efer) => 4,
            _ => 8,
        };

        Ok(VmInfo {
            page_size: PAGE_SIZE,
            page_shift: PAGE_SHIFT,
            memsize: self.memsize,
            vcpus: self.vcpus,
            address_width,
            hvm: true,
        })
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> Result<String, VmiError> {
        Ok(self.name.clone())
    }

    fn map_frame(&self, gfn: Gfn, _protection: FrameProtection) -> Result<MappedFrame, VmiError> {
        let mut page = vec![0u8; PAGE_SIZE as usize];
        let paddr = gfn.0 << PAGE_SHIFT;

        match &mut *self.memory.borrow_mut() {
            MemoryChannel::Monitor(pmem) => pmem.read(paddr, &mut page).map_err(VmiError::from)?,
            MemoryChannel::Gdb(gdb) => gdb.read(paddr, &mut page).map_err(VmiError::from)?,
        }

        Ok(MappedFrame::new(page))
    }

    fn write(&self, paddr: Pa, buf: &[u8]) -> Result<(), VmiError> {
        match &mut *self.memory.borrow_mut() {
            MemoryChannel::Monitor(pmem) => pmem.write(paddr.0, buf).map_err(VmiError::from)?,
            MemoryChannel::Gdb(gdb) => gdb.write(paddr.0, buf).map_err(VmiError::from)?,
        }
        Ok(())
    }

    fn vcpureg(&self, reg: RegisterId, vcpu: VcpuId) -> Result<u64, VmiError> {
        Ok(self.registers(vcpu).map_err(VmiError::from)?.read(reg))
    }

    fn pause(&self) -> Result<(), VmiError> {
        self.qmp
            .borrow_mut()
            .execute("stop", None)
            .map_err(VmiError::from)?;
        Ok(())
    }

    fn resume(&self) -> Result<(), VmiError> {
        self.qmp
            .borrow_mut()
            .execute("cont", None)
            .map_err(VmiError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_rejects_a_plain_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let options = KvmOptions {
            monitor_socket: file.path().to_path_buf(),
            gdb_addr: None,
            memory_path: KvmMemoryPath::Auto,
            id: 0,
        };

        assert!(!KvmDriver::probe(&options));
    }

    #[test]
    fn probe_accepts_a_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let options = KvmOptions {
            monitor_socket: path,
            gdb_addr: None,
            memory_path: KvmMemoryPath::Auto,
            id: 0,
        };

        assert!(KvmDriver::probe(&options));
    }
}
