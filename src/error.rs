use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Key not found")]
    NotFound,

    #[error("Resource busy")]
    Busy,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Unknown command: {0}")]
    UnknownCommand(u64),

    #[error("Server returned status {0}")]
    Status(u64),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wire status code for this error. Zero is reserved for success.
    pub fn code(&self) -> u64 {
        let errno = match self {
            Error::InvalidArgument(_) | Error::NotFound | Error::UnknownCommand(_) => libc::EINVAL,
            Error::Busy => libc::EBUSY,
            Error::InvalidState(_) => libc::EBADF,
            Error::OutOfMemory => libc::ENOMEM,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Status(code) => return *code,
            Error::ConnectionClosed => libc::ECONNRESET,
            Error::Config(_) => libc::EIO,
        };
        errno as u64
    }

    /// True for errors that leave the socket unusable.
    pub fn is_fatal_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed)
    }
}
