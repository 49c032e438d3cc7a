use std::io;

use thiserror::Error;

use crate::Protection;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while creating, maintaining or releasing a memory map.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested file offset is not a multiple of the page size.
    ///
    /// Detected before any system call is made.
    #[error("offset {offset} must be a multiple of the system's page size {page_size}")]
    Alignment { offset: u64, page_size: usize },

    /// The protection flags combine `READ_WRITE` with `COPY`, or carry unknown bits.
    #[error("unsupported protection flags {0:?}")]
    InvalidProtection(Protection),

    /// The length of the backing file could not be determined.
    #[error("unable to query file size: {0}")]
    FileSize(#[source] io::Error),

    /// The native call creating the mapping failed.
    #[error("{call} failed: {source}")]
    Map {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{call} failed: {source}")]
    Flush {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{call} failed: {source}")]
    Lock {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Releasing the view or the objects backing it failed.
    #[error("{call} failed: {source}")]
    Unmap {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// A write was attempted through a read-only mapping.
    #[error("mapping is read-only")]
    ReadOnly,

    /// The mapping has already been closed.
    #[error("mapping is closed")]
    Closed,
}

impl Error {
    /// Builds a `Map` error from the calling thread's last OS error.
    pub(crate) fn map(call: &'static str) -> Error {
        Error::Map { call, source: io::Error::last_os_error() }
    }

    /// The offset or end of the region does not fit the native call's offset type.
    pub(crate) fn offset_out_of_range(call: &'static str) -> Error {
        Error::Map {
            call,
            source: io::Error::new(io::ErrorKind::InvalidInput, "file offset out of range"),
        }
    }

    pub(crate) fn flush(call: &'static str) -> Error {
        Error::Flush { call, source: io::Error::last_os_error() }
    }

    pub(crate) fn lock(call: &'static str) -> Error {
        Error::Lock { call, source: io::Error::last_os_error() }
    }

    pub(crate) fn unmap(call: &'static str) -> Error {
        Error::Unmap { call, source: io::Error::last_os_error() }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::Alignment { .. } | Error::InvalidProtection(_) => io::ErrorKind::InvalidInput,
            Error::FileSize(ref e)
            | Error::Map { source: ref e, .. }
            | Error::Flush { source: ref e, .. }
            | Error::Lock { source: ref e, .. }
            | Error::Unmap { source: ref e, .. } => e.kind(),
            Error::ReadOnly => io::ErrorKind::PermissionDenied,
            Error::Closed => io::ErrorKind::NotConnected,
        };
        io::Error::new(kind, err)
    }
}
