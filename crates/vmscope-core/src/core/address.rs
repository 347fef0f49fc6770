use serde::{Deserialize, Serialize};

use super::macros::impl_addr;

impl_addr!(Gfn, "guest page frame number");
impl_addr!(Pa, "guest physical address");
impl_addr!(Va, "guest virtual address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// The address space a read or write operates in.
///
/// Virtual accesses carry the physical address of the page-table root
/// (the *address-space identifier*) so the core can walk the guest's
/// paging structures without consulting any per-process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Guest physical memory; the address is used as-is.
    Physical,

    /// Guest virtual memory translated through the kernel's page tables.
    ///
    /// The root is taken from CR3 of vCPU 0 at the time of the access.
    Kernel,

    /// Guest virtual memory translated through an explicit page-table root.
    ///
    /// OS-introspection layers resolve a process to its root and pass it
    /// here; the core never walks process lists itself.
    Process {
        /// Physical address of the page-table root (CR3-equivalent).
        root: Pa,
    },
}
