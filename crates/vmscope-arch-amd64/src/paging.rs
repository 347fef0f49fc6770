use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use vmscope_core::Gfn;

/// The guest's paging level, which selects the page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// 32-bit two-level paging.
    Legacy,

    /// Physical Address Extension: three levels, 64-bit entries.
    Pae,

    /// IA-32e four-level long-mode paging.
    Ia32e,
}

impl PageMode {
    /// Derives the paging mode from control state of a running vCPU.
    ///
    /// Returns `None` when paging is disabled (CR0.PG clear).
    pub fn detect(cr0: u64, cr4: u64, efer: u64) -> Option<Self> {
        const CR0_PG: u64 = 1 << 31;
        const CR4_PAE: u64 = 1 << 5;

        if cr0 & CR0_PG == 0 {
            return None;
        }

        if super::efer_long_mode(efer) {
            Some(Self::Ia32e)
        } else if cr4 & CR4_PAE != 0 {
            Some(Self::Pae)
        } else {
            Some(Self::Legacy)
        }
    }

    /// The guest address width implied by the paging mode, in bytes.
    pub fn address_width(self) -> u8 {
        match self {
            Self::Legacy | Self::Pae => 4,
            Self::Ia32e => 8,
        }
    }
}

/// A 64-bit page-table entry (PAE and IA-32e formats; legacy 32-bit
/// entries are widened before being wrapped).
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Checks if the entry is writable.
    pub fn write(self) -> bool {
        (self.0 >> 1) & 1 != 0
    }

    /// Checks if the entry is accessible in user mode.
    pub fn user(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }

    /// Checks if the entry maps a large page (PS bit).
    pub fn large(self) -> bool {
        (self.0 >> 7) & 1 != 0
    }

    /// Extracts the frame number the entry points to.
    pub fn pfn(self) -> Gfn {
        const BITS: u64 = 40;
        const MASK: u64 = (1 << BITS) - 1;
        Gfn::new((self.0 >> 12) & MASK)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .field("large", &self.large())
            .field("pfn", &self.pfn())
            .finish()
    }
}
