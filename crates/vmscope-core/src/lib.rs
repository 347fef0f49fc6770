//! Core types and contracts for guest-memory introspection.
//!
//! This crate defines the driver contract every memory backend implements,
//! the address and access vocabulary shared across the workspace, the
//! page-frame cache, and the configuration/OS-profile plumbing. The
//! session type that ties a backend, cache, and event registry together
//! lives in the `vmscope` facade crate.

pub mod access;
mod cache;
pub mod config;
mod core;
mod driver;
mod error;
mod event;
mod frame;
pub mod os;
mod registers;

pub use self::{
    access::{AccessMode, IncompatibleAccess, RegAccess},
    cache::PageCache,
    core::{AddressSpace, FrameProtection, Gfn, MemoryAccess, Pa, Va, VcpuId, VcpuSet, VmInfo},
    driver::Driver,
    error::{Error, PageFault, PageFaults},
    event::{EventSpec, Granularity, GuestEvent, MemEventDesc, RegEventDesc, SinglestepDesc},
    frame::MappedFrame,
    registers::RegisterId,
};
