//! Error type shared by every cache operation.
//!
//! Backend failures, short transfers and resize rejections all leave the
//! cache state untouched; see the individual variants for what the caller
//! can expect afterwards.

use thiserror::Error;

use crate::backend::NodeId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Transport-level failure talking to the backing store.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend moved fewer bytes than requested. Dirty state is kept so
    /// the caller can retry.
    #[error("short transfer at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// The backend refused a set-size request; the file size is unchanged.
    #[error("resize to {size} rejected: {reason}")]
    ResizeRejected { size: u64, reason: String },

    /// No buffer could be allocated, even after evicting clean buffers and
    /// flushing dirty ones.
    #[error("out of cache memory")]
    OutOfCacheMemory,

    #[error("invalid range: offset {offset}, length {len}")]
    InvalidRange { offset: u64, len: u64 },

    /// A mapped write reached past the end of the file.
    #[error("access at offset {offset} is beyond end of file ({size})")]
    BeyondEof { offset: u64, size: u64 },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("node {0} is not open")]
    NotOpen(NodeId),

    #[error("flush workers have been shut down")]
    WorkerShutdown,

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// POSIX errno suitable for a FUSE reply.
    pub fn to_errno(&self) -> i32 {
        match self {
            CacheError::BackendUnavailable(_) => libc::EIO,
            CacheError::ShortTransfer { .. } => libc::EIO,
            CacheError::ResizeRejected { .. } => libc::EINVAL,
            CacheError::OutOfCacheMemory => libc::ENOMEM,
            CacheError::InvalidRange { .. } => libc::EINVAL,
            CacheError::BeyondEof { .. } => libc::EFAULT,
            CacheError::Unsupported(_) => libc::EOPNOTSUPP,
            CacheError::NotOpen(_) => libc::EBADF,
            CacheError::WorkerShutdown => libc::ESHUTDOWN,
            CacheError::InvalidConfig(_) => libc::EINVAL,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::BackendUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(CacheError::OutOfCacheMemory.to_errno(), libc::ENOMEM);
        assert_eq!(
            CacheError::ShortTransfer {
                offset: 0,
                expected: 4,
                actual: 2
            }
            .to_errno(),
            libc::EIO
        );
        assert_eq!(CacheError::NotOpen(42).to_errno(), libc::EBADF);
    }

    #[test]
    fn test_io_error_is_backend_unavailable() {
        let err: CacheError = std::io::Error::other("socket closed").into();
        assert!(matches!(err, CacheError::BackendUnavailable(msg) if msg.contains("socket closed")));
    }
}
