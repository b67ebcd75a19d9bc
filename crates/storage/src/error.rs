//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File or directory does not exist
    #[display("not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied (permissions or credentials)
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Something already exists at the path (for operations that require new paths)
    #[display("already exists: {}", _0.display())]
    AlreadyExists(#[error(not(source))] PathBuf),
    /// A directory was required
    #[display("not a directory: {}", _0.display())]
    NotADirectory(#[error(not(source))] PathBuf),
    /// A file was required
    #[display("is a directory: {}", _0.display())]
    IsADirectory(#[error(not(source))] PathBuf),
    /// Path contains invalid characters or escapes root
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// The write handle is unknown to the backend (closed, aborted, or never opened)
    #[display("invalid write handle: {_0}")]
    InvalidHandle(#[error(not(source))] u64),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Connection-level failure talking to a remote backend
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// The backend rate-limited the request; back off and try again
    #[display("request throttled by backend")]
    Throttled,
    /// The backend did not answer in time (large directory listings)
    #[display("backend request timed out")]
    Timeout,
    /// Cancelled while waiting to retry
    #[display("interrupted while backing off")]
    Interrupted,
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Throttled)
    }

    /// Returns `true` for the "nothing there" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Map an I/O error onto the closest actionable category for `path`.
    pub fn from_io(e: IoError, path: &Path) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_path_buf()),
            std::io::ErrorKind::NotADirectory => Self::NotADirectory(path.to_path_buf()),
            std::io::ErrorKind::IsADirectory => Self::IsADirectory(path.to_path_buf()),
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}
