use serde::{Deserialize, Serialize};

/// Static facts about the introspected virtual machine, discovered at
/// backend initialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VmInfo {
    /// The size of a guest page in bytes.
    pub page_size: u64,

    /// The shift value to convert between addresses and frame numbers.
    pub page_shift: u64,

    /// Total guest physical memory in bytes.
    pub memsize: u64,

    /// The number of virtual CPUs.
    pub vcpus: u16,

    /// The guest address width in bytes (4 or 8).
    pub address_width: u8,

    /// Whether the guest runs under hardware virtualization extensions
    /// (as opposed to paravirtualization).
    pub hvm: bool,
}
