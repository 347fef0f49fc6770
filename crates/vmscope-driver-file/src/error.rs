/// Error type for the snapshot-file driver.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(std::io::Error),

    /// The address lies outside the snapshot.
    OutOfBounds,

    /// The snapshot was opened read-only.
    ReadOnly,

    /// Operation not supported.
    NotSupported,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<Error> for vmscope_core::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(value) => Self::Io(value),
            Error::OutOfBounds => Self::OutOfBounds,
            Error::ReadOnly => Self::AccessDenied,
            Error::NotSupported => Self::NotSupported,
        }
    }
}
