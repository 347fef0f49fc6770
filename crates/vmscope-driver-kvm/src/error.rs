/// Error type for the KVM driver.
#[derive(Debug)]
pub enum Error {
    /// An I/O error on the monitor or stub socket.
    Io(std::io::Error),

    /// The monitor rejected a command.
    Monitor(String),

    /// A malformed monitor or stub reply.
    Protocol(&'static str),

    /// A JSON (de)serialization error.
    Json(serde_json::Error),

    /// The GDB stub reported an error reply.
    Stub(String),

    /// Operation not supported.
    NotSupported,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "monitor i/o error: {e}"),
            Self::Monitor(desc) => write!(f, "monitor error: {desc}"),
            Self::Protocol(what) => write!(f, "protocol error: {what}"),
            Self::Json(e) => write!(f, "malformed monitor reply: {e}"),
            Self::Stub(reply) => write!(f, "gdb stub error: {reply}"),
            Self::NotSupported => write!(f, "operation not supported"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for vmscope_core::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(value) => Self::Io(value),
            Error::NotSupported => Self::NotSupported,
            other => Self::Driver(Box::new(other)),
        }
    }
}
