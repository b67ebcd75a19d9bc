//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, a narrow interface over a
//! hierarchical file store (the local filesystem, the DBFS REST API, or an
//! in-memory tree for tests). Remote stores only offer a simplistic,
//! chunked and non-atomic write primitive, so the trait exposes exactly that
//! instead of a streaming writer.

#[cfg(feature = "dbfs")]
mod dbfs;
mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod retry;

#[cfg(feature = "dbfs")]
pub use self::dbfs::DbfsBackend;
pub use self::local::LocalBackend;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockBackend;
pub use self::retry::{RetryPolicy, RetryingBackend};
use crate::error::{ErrorKind, Result};
use crate::models::FileInfo;
use async_trait::async_trait;
use std::path::Path;

/// Largest block accepted by a single append on the DBFS data API.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Opaque token for an open chunked write.
///
/// Handles are only meaningful to the backend that issued them and become
/// invalid after [`close_write()`](StorageBackend::close_write) or
/// [`abort_write()`](StorageBackend::abort_write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle(pub u64);

/// Unified interface for storage backends.
///
/// # Path Handling
/// All paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations
/// enforce this validation; the empty path is the root directory.
///
/// # Concurrency
/// Remote backends rate-limit aggressively. Callers issue one request at a
/// time and never append to the same handle concurrently.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use fastdbfs_storage::{backend::StorageBackend, error::Result};
///
/// async fn total_size(backend: &dyn StorageBackend, dir: &Path) -> Result<u64> {
///     let children = backend.list(dir).await?;
///     Ok(children.iter().filter(|info| !info.is_dir).map(|info| info.size).sum())
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (taken from the profile name). Used
    /// for logging only.
    fn name(&self) -> &str;

    /// Get node metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if nothing
    /// exists at `path`.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Check whether anything exists at `path`.
    ///
    /// The default implementation maps a `NotFound` from
    /// [`stat()`](Self::stat) to `false`.
    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// List the direct children of a directory.
    ///
    /// Order is whatever the backend returns; callers must not assume it is
    /// sorted. Listing a file returns
    /// [`NotADirectory`](crate::error::ErrorKind::NotADirectory). A listing
    /// that takes too long may fail with
    /// [`Timeout`](crate::error::ErrorKind::Timeout).
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::path::Path;
    /// # use fastdbfs_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// for info in backend.list(Path::new("FileStore/tables")).await? {
    ///     println!("{}: {} bytes", info.path.display(), info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    async fn list(&self, dir: &Path) -> Result<Vec<FileInfo>>;

    /// Create a directory, including any missing parents. Succeeds if the
    /// directory already exists.
    async fn mkdir(&self, path: &Path) -> Result<()>;

    /// Delete a file or directory.
    ///
    /// Deleting a non-empty directory requires `recursive`.
    async fn delete(&self, path: &Path, recursive: bool) -> Result<()>;

    /// Move a node within the same backend.
    ///
    /// Returns [`AlreadyExists`](crate::error::ErrorKind::AlreadyExists)
    /// when `to` exists and `overwrite` is false.
    ///
    /// # Notes
    /// - Implementations should create parent directories as needed
    async fn rename(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()>;

    /// Begin a chunked write at `path`.
    ///
    /// Data appended through the returned handle may become visible at
    /// `path` before [`close_write()`](Self::close_write) on non-atomic
    /// backends; write to a staging path and rename when that matters.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::path::Path;
    /// # use fastdbfs_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let handle = backend.open_write(Path::new("tmp/.report.csv.part"), true).await?;
    /// for block in [b"a,b\n".as_slice(), b"1,2\n".as_slice()] {
    ///     if let Err(err) = backend.append_block(handle, block).await {
    ///         backend.abort_write(handle).await?;
    ///         return Err(err);
    ///     }
    /// }
    /// backend.close_write(handle).await?;
    /// backend.rename(Path::new("tmp/.report.csv.part"), Path::new("tmp/report.csv"), true).await?;
    /// # Ok(())
    /// # }
    /// ```
    async fn open_write(&self, path: &Path, overwrite: bool) -> Result<WriteHandle>;

    /// Append one block to an open write. Blocks must not exceed
    /// [`max_block_size()`](Self::max_block_size).
    async fn append_block(&self, handle: WriteHandle, data: &[u8]) -> Result<()>;

    /// Finish a write and release the handle.
    async fn close_write(&self, handle: WriteHandle) -> Result<()>;

    /// Release a handle without finishing the write. Whatever was written
    /// stays behind at the write path and must be deleted by the caller.
    async fn abort_write(&self, handle: WriteHandle) -> Result<()>;

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// A short (or empty) result means end of file was reached.
    async fn read_range(&self, path: &Path, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Largest block accepted by [`append_block()`](Self::append_block).
    fn max_block_size(&self) -> usize {
        DEFAULT_MAX_BLOCK_SIZE
    }
}

/// Move `from` over an existing `to` for backends whose native move cannot
/// replace a destination.
///
/// The old destination is parked at a hidden sibling until the move has
/// landed, then deleted. If the move fails the old destination is put back,
/// so there is never a moment where a failure leaves neither version.
pub async fn replace<B: StorageBackend + ?Sized>(backend: &B, from: &Path, to: &Path) -> Result<()> {
    let name = to.file_name().ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(to.to_path_buf())))?;
    let backup = to.with_file_name(format!(".{}.fastdbfs-backup", name.to_string_lossy()));

    let parked = match backend.rename(to, &backup, false).await {
        Ok(()) => true,
        Err(err) if err.is_not_found() => false,
        Err(err) if matches!(&*err, ErrorKind::AlreadyExists(_)) => {
            // Left behind by an earlier run that died before cleaning up.
            backend.delete(&backup, true).await?;
            backend.rename(to, &backup, false).await?;
            true
        },
        Err(err) => return Err(err),
    };

    if let Err(err) = backend.rename(from, to, false).await {
        if parked && let Err(restore) = backend.rename(&backup, to, false).await {
            tracing::error!(path = %to.display(), backup = %backup.display(), "unable to restore replaced file: {restore}");
        }
        return Err(err);
    }
    if parked && let Err(err) = backend.delete(&backup, true).await {
        tracing::warn!(path = %backup.display(), "unable to remove backup: {err}");
    }
    Ok(())
}

pub(crate) fn check_block_size(data: &[u8], max: usize) -> Result<()> {
    if data.len() > max {
        exn::bail!(ErrorKind::BackendError(format!(
            "block of {} bytes exceeds the maximum of {max}",
            data.len()
        )));
    }
    Ok(())
}
