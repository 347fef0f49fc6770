//! Live-KVM backend over the VM monitor.
//!
//! Control operations and registers go through the QMP socket; memory goes
//! through the patched monitor's physical-memory channel when available,
//! or a GDB stub otherwise.

mod driver;
mod error;
mod gdb;
mod pmem;
mod qmp;
mod regs;

pub use self::{
    driver::{KvmDriver, KvmMemoryPath, KvmOptions},
    error::Error,
};
