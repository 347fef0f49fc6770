//! The access-mode algebra used by the event registry.
//!
//! A page's effective access mask is the combination of every event
//! registered on it. Combination is a total function: it either yields a
//! new mode or reports that the request is incompatible, it never panics.

use serde::{Deserialize, Serialize};

use crate::MemoryAccess;

/// The kind of access an event traps on.
///
/// `ExecuteOnWrite` is a distinguished mode that traps only when a page is
/// both written to and executed from; the hypervisor implements it as a
/// self-contained page state, so it cannot be combined with any other mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// No access is trapped.
    #[default]
    None,

    /// Any combination of read, write, and execute accesses is trapped.
    Mask(MemoryAccess),

    /// Execute-on-write: trap when the page transitions from writable to
    /// executable use. Not composable with any other mode.
    ExecuteOnWrite,
}

/// The error returned when two access modes cannot be combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompatibleAccess;

impl AccessMode {
    /// Creates a mode from raw permission bits, normalizing the empty mask
    /// to `None`.
    pub fn from_bits(bits: MemoryAccess) -> Self {
        if bits.is_empty() {
            Self::None
        } else {
            Self::Mask(bits)
        }
    }

    /// Returns the permission bits trapped by this mode, if it is a plain
    /// mask.
    pub fn bits(self) -> Option<MemoryAccess> {
        match self {
            Self::None => Some(MemoryAccess::empty()),
            Self::Mask(bits) => Some(bits),
            Self::ExecuteOnWrite => None,
        }
    }

    /// Combines this mode with an additional request.
    ///
    /// - combining equal modes is the identity,
    /// - `None` is the identity element,
    /// - `ExecuteOnWrite` is incompatible with any other mode,
    /// - two masks combine to their union.
    pub fn combine(self, add: Self) -> Result<Self, IncompatibleAccess> {
        if self == add {
            return Ok(self);
        }

        match (self, add) {
            (Self::None, other) | (other, Self::None) => Ok(other),
            (Self::ExecuteOnWrite, _) | (_, Self::ExecuteOnWrite) => Err(IncompatibleAccess),
            (Self::Mask(base), Self::Mask(add)) => Ok(Self::Mask(base | add)),
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("---"),
            Self::Mask(bits) => bits.fmt(f),
            Self::ExecuteOnWrite => f.write_str("x-on-w"),
        }
    }
}

bitflags::bitflags! {
    /// The kind of access a register event traps on.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RegAccess: u8 {
        /// Trap register reads.
        const R = 0b01;

        /// Trap register writes.
        const W = 0b10;

        /// Trap both.
        const RW = Self::R.bits() | Self::W.bits();
    }
}
