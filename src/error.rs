//! Library-wide error type.
use std::{error, fmt, io, sync};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// An invalid argument, such as a malformed `host:port` string.
    ArgumentError(String),
    /// The server rejected the authentication handshake.
    AuthenticationError(String),
    /// A transport-level failure while talking to a server.
    IoError(io::Error),
    /// A connection lock was poisoned by a panicking holder.
    PoisonLockError,
    /// An operation failed, or no server satisfied the request.
    OperationError(String),
    /// The server sent a reply the driver could not interpret.
    ResponseError(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::PoisonLockError
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ArgumentError(inner) => inner.fmt(fmt),
            Error::AuthenticationError(inner) => inner.fmt(fmt),
            Error::IoError(inner) => inner.fmt(fmt),
            Error::PoisonLockError => write!(fmt, "Connection lock poisoned."),
            Error::OperationError(inner) => inner.fmt(fmt),
            Error::ResponseError(inner) => inner.fmt(fmt),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(inner) => Some(inner),
            _ => None,
        }
    }
}
