use crate::{Pa, Va};

/// An error that can occur while introspecting a virtual machine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred in the backend driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Backend initialization failed.
    #[error("initialization failed: {0}")]
    InitFailed(&'static str),

    /// A page fault occurred during a page-table walk.
    #[error("page not present ({:?})", .0[0])]
    PageFault(PageFaults),

    /// Operation not supported by the backend.
    #[error("operation not supported")]
    NotSupported,

    /// The requested register is not in the backend's supported subset.
    #[error("register not supported by this backend")]
    UnsupportedRegister,

    /// A frame mapping or register fetch was denied.
    #[error("access denied by the backend")]
    AccessDenied,

    /// An event is already registered at this key.
    #[error("an event is already registered at this key")]
    AlreadyRegistered,

    /// The requested access mode cannot be combined with the page's
    /// existing registrations.
    #[error("incompatible access combination")]
    IncompatibleAccess,

    /// No registration exists at this key.
    #[error("no event registered at this key")]
    NotFound,

    /// The address lies outside guest physical memory.
    #[error("out of bounds")]
    OutOfBounds,

    /// The guest reported an address width other than 4 or 8 bytes.
    #[error("invalid address width")]
    InvalidAddressWidth,

    /// The given timeout cannot be represented.
    #[error("invalid timeout")]
    InvalidTimeout,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl From<crate::access::IncompatibleAccess> for Error {
    fn from(_: crate::access::IncompatibleAccess) -> Self {
        Self::IncompatibleAccess
    }
}

/// A fault encountered while walking the guest's paging structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFault {
    /// The virtual address that faulted.
    pub address: Va,

    /// The root of the page-table hierarchy the walk started from.
    pub root: Pa,
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[PageFault; 1]>;

impl From<(Va, Pa)> for PageFault {
    fn from((address, root): (Va, Pa)) -> Self {
        Self { address, root }
    }
}

impl Error {
    /// Creates a new page fault error.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::PageFault(smallvec::smallvec![pf.into()])
    }
}
