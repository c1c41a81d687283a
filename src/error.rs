//! Error kinds surfaced by the chunk I/O core.

use std::io;

use thiserror::Error;

/// Errors produced by image I/O, the caches, and the transport.
#[derive(Debug, Error)]
pub enum IoError {
    /// The requested range starts at or past the logical end of the image.
    #[error("end of file")]
    Eof,

    /// The origin (or a cache read standing in for it) delivered fewer bytes
    /// than the chunk requires.
    #[error("premature end of file: got {got} of {want} bytes")]
    PrematureEof {
        /// Bytes actually delivered.
        got: u64,
        /// Bytes required.
        want: u64,
    },

    /// On-disk cache state failed validation.
    #[error("invalid cache state: {0}")]
    InvalidCache(String),

    /// The filesystem request was cancelled while waiting.
    #[error("operation interrupted")]
    Interrupted,

    /// Permanent origin failure, including a validator mismatch. Retrying
    /// cannot succeed.
    #[error("fatal transport error: {0}")]
    TransportFatal(String),

    /// Transient transport failure; the caller may retry.
    #[error("network error: {0}")]
    TransportNetwork(String),

    /// The image was closed.
    #[error("image is closed")]
    Closed,

    /// Local file I/O failure in one of the stores.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IoError {
    /// The errno reported through the filesystem surface for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            IoError::Eof | IoError::PrematureEof { .. } => libc::EIO,
            IoError::InvalidCache(_) => libc::EIO,
            IoError::Interrupted => libc::EINTR,
            IoError::TransportFatal(_) | IoError::TransportNetwork(_) => libc::EIO,
            IoError::Closed => libc::EACCES,
            IoError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether this error is an expected consequence of request cancellation
    /// rather than a fault worth logging.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, IoError::Interrupted)
    }
}

/// Result alias used throughout the crate.
pub type IoResult<T> = Result<T, IoError>;

impl From<nix::Error> for IoError {
    fn from(err: nix::Error) -> Self {
        IoError::Io(io::Error::from(err))
    }
}
