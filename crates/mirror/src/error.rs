//! Mirror Error Types
//!
//! Errors from the walker, planner and transfer engine. Storage failures are
//! kept as children in the error tree; the kinds here say what went wrong at
//! the level of the operation.

use derive_more::{Display, Error};
use fastdbfs_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};
use std::path::PathBuf;

/// A mirror error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Listing a directory took longer than the configured limit
    #[display("listing timed out: {}", _0.display())]
    ListingTimeout(#[error(not(source))] PathBuf),
    /// Listing a directory failed for any other reason
    #[display("unable to list directory: {}", _0.display())]
    ListingFailure(#[error(not(source))] PathBuf),
    /// The destination exists and policy forbids replacing it
    #[display("destination already exists: {}", _0.display())]
    Conflict(#[error(not(source))] PathBuf),
    /// The backend kept rate-limiting requests after every retry
    #[display("backend kept throttling requests")]
    Throttled,
    /// Moving one file failed; any partial data was cleaned up
    #[display("transfer failed: {}", _0.display())]
    TransferFailure(#[error(not(source))] PathBuf),
    /// The bytes that arrived do not add up to the bytes sent
    #[display("size mismatch for {}: expected {expected} bytes, got {actual}", path.display())]
    Corrupted {
        #[error(not(source))]
        path: PathBuf,
        #[error(not(source))]
        expected: u64,
        #[error(not(source))]
        actual: u64,
    },
    /// The user interrupted the operation
    #[display("operation cancelled")]
    Cancelled,
    /// A storage backend operation failed
    #[display("storage backend error")]
    Storage,
    /// Reading or writing a local file failed
    #[display("local I/O error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled)
    }
}

/// Re-raise a storage error, keeping throttling and cancellation visible at this level.
pub(crate) fn storage(err: StorageError) -> Error {
    let kind = match &*err {
        StorageErrorKind::Throttled => ErrorKind::Throttled,
        StorageErrorKind::Interrupted => ErrorKind::Cancelled,
        _ => ErrorKind::Storage,
    };
    err.raise(kind)
}
