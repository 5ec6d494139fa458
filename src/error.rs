//! Error types shared across the store.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by store, journal and pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object, collection or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Object or collection already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Attribute is absent on an object that does exist.
    #[error("no data: {0}")]
    NoData(String),
    /// Malformed argument (bad prefix, bad range, bad name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The backing device or filesystem is out of space.
    #[error("no space left on device")]
    NoSpace,
    /// An underlying I/O failure.
    #[error("store I/O error: {source}")]
    Io {
        /// The underlying cause.
        #[source]
        source: io::Error,
    },
    /// On-disk data failed validation (magic, checksum, framing).
    #[error("corruption: {0}")]
    Corruption(String),
    /// The resource is held by someone else (lease denied, store locked).
    #[error("busy: {0}")]
    Busy(String),
    /// The operation was skipped because its replay guard says it already ran.
    #[error("skipped by replay guard")]
    ReplaySkip,
    /// The pipeline has failed and no longer accepts work.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Classify an `io::Error`, distinguishing out-of-space conditions.
    pub fn from_io(err: io::Error) -> Self {
        #[cfg(unix)]
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return Error::NoSpace;
        }
        if err.kind() == io::ErrorKind::NotFound {
            return Error::NotFound(err.to_string());
        }
        Error::Io { source: err }
    }

    /// The error's category, for matching without destructuring payloads.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NoData(_) => ErrorKind::NoData,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NoSpace => ErrorKind::NoSpace,
            Error::Io { .. } => ErrorKind::Io,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Busy(_) => ErrorKind::Busy,
            Error::ReplaySkip => ErrorKind::ReplaySkip,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

/// Category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::AlreadyExists`].
    AlreadyExists,
    /// See [`Error::NoData`].
    NoData,
    /// See [`Error::InvalidArgument`].
    InvalidArgument,
    /// See [`Error::NoSpace`].
    NoSpace,
    /// See [`Error::Io`].
    Io,
    /// See [`Error::Corruption`].
    Corruption,
    /// See [`Error::Busy`].
    Busy,
    /// See [`Error::ReplaySkip`].
    ReplaySkip,
    /// See [`Error::Fatal`].
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::NoSpace.kind(), ErrorKind::NoSpace);
        assert_eq!(Error::ReplaySkip.kind(), ErrorKind::ReplaySkip);
    }

    #[test]
    fn test_from_io_not_found() {
        let err = Error::from_io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_from_io_enospc() {
        let err = Error::from_io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_io_error_keeps_cause() {
        let err = Error::from_io(io::Error::other("disk fell over"));
        match err {
            Error::Io { source } => assert_eq!(source.to_string(), "disk fell over"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
