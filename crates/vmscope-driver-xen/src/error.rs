/// Error type for the Xen driver.
#[derive(Debug)]
pub enum Error {
    /// None of the candidate library names could be loaded.
    LibraryNotFound(&'static str),

    /// The control library lacks a required symbol.
    SymbolNotFound(&'static str),

    /// `xc_interface_open` failed.
    InterfaceOpen,

    /// The domain does not exist.
    DomainNotFound(u32),

    /// A control operation failed.
    Control(&'static str),

    /// A foreign-frame map failed.
    MapFailed(u64),

    /// An I/O error occurred.
    Io(std::io::Error),

    /// The guest reported an address width other than 4 or 8 bytes.
    InvalidAddressWidth,

    /// The given timeout cannot be represented.
    InvalidTimeout,

    /// The register is outside this guest type's supported subset.
    UnsupportedRegister,

    /// Operation not supported.
    NotSupported,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::LibraryNotFound(name) => write!(f, "cannot load {name}"),
            Self::SymbolNotFound(name) => write!(f, "symbol {name} not found"),
            Self::InterfaceOpen => write!(f, "failed to open the control interface"),
            Self::DomainNotFound(domid) => write!(f, "domain {domid} not found"),
            Self::Control(op) => write!(f, "{op} failed"),
            Self::MapFailed(pfn) => write!(f, "failed to map pfn 0x{pfn:x}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::InvalidAddressWidth => write!(f, "invalid guest address width"),
            Self::InvalidTimeout => write!(f, "invalid timeout"),
            Self::UnsupportedRegister => write!(f, "register not supported"),
            Self::NotSupported => write!(f, "operation not supported"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for vmscope_core::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::LibraryNotFound(_) => Self::InitFailed("Xen control library not found"),
            Error::SymbolNotFound(_) => Self::InitFailed("Xen control library is incomplete"),
            Error::InterfaceOpen => Self::InitFailed("cannot open the Xen control interface"),
            Error::DomainNotFound(_) => Self::InitFailed("domain not found"),
            Error::MapFailed(_) => Self::AccessDenied,
            Error::Io(value) => Self::Io(value),
            Error::InvalidAddressWidth => Self::InvalidAddressWidth,
            Error::InvalidTimeout => Self::InvalidTimeout,
            Error::UnsupportedRegister => Self::UnsupportedRegister,
            Error::NotSupported => Self::NotSupported,
            other => Self::Driver(Box::new(other)),
        }
    }
}
