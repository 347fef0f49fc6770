//! AMD64 register file, paging structures, and the virtual-to-physical
//! page-table walk.

mod paging;
mod registers;
mod translation;

pub use self::{
    paging::{PageMode, PageTableEntry},
    registers::{
        efer_long_mode, DescriptorTable, Registers, SegmentDescriptor, EFER_LONG_MODE_BIT,
    },
    translation::{translate, ReadPhysical},
};

/// The size of a guest page in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// The shift converting between addresses and frame numbers.
pub const PAGE_SHIFT: u64 = 12;

/// The mask isolating the frame part of an address.
pub const PAGE_MASK: u64 = !0xfff;

use vmscope_core::{Gfn, Pa};

/// Converts a guest physical address to its frame number.
pub fn gfn_from_pa(pa: Pa) -> Gfn {
    Gfn(pa.0 >> PAGE_SHIFT)
}

/// Converts a frame number to the physical address of its first byte.
pub fn pa_from_gfn(gfn: Gfn) -> Pa {
    Pa(gfn.0 << PAGE_SHIFT)
}

/// Extracts the intra-page offset of a physical address.
pub fn pa_offset(pa: Pa) -> u64 {
    pa.0 & !PAGE_MASK
}
