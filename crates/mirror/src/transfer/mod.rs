//! Chunked, atomic single-file transfers.
//!
//! Both directions write to a hidden temporary file beside the destination
//! and only move it into place once every byte has arrived, so an
//! interrupted transfer never leaves a truncated file under the real name.

mod download;
mod upload;

pub use self::download::download;
pub use self::upload::{SessionState, UploadSession, upload};
pub(crate) use self::upload::is_staging_name;

use crate::error::{Error, ErrorKind, Result};
use crate::{Context, Direction};
use exn::ResultExt;
use fastdbfs_storage::StorageBackend;
use std::path::Path;

/// Bytes moved so far for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes: u64,
    pub total: u64,
}

/// Called after every chunk.
pub type Progress<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// Wrap a failure in [`ErrorKind::TransferFailure`], except for the kinds
/// callers need to tell apart.
pub(crate) fn transfer_failure(err: Error, path: &Path) -> Error {
    match &*err {
        ErrorKind::Cancelled | ErrorKind::Conflict(_) => err,
        _ => err.raise(ErrorKind::TransferFailure(path.to_path_buf())),
    }
}

/// Copy a single file between the remote backend and local disk.
///
/// `source` and `destination` are interpreted according to `direction`:
/// for uploads the source is local and the destination remote, for
/// downloads the other way round. Without `overwrite`, an existing
/// destination is a [`Conflict`](ErrorKind::Conflict) and nothing is
/// transferred.
pub async fn transfer_one(
    remote: &dyn StorageBackend,
    ctx: &Context,
    direction: Direction,
    source: &Path,
    destination: &Path,
    overwrite: bool,
    progress: Option<Progress<'_>>,
) -> Result<u64> {
    match direction {
        Direction::Download => download(remote, ctx, source, destination, overwrite, progress).await,
        Direction::Upload => {
            let metadata = tokio::fs::metadata(source).await.or_raise(|| ErrorKind::Io(source.to_path_buf()))?;
            if metadata.is_dir() {
                exn::bail!(ErrorKind::Io(source.to_path_buf()));
            }
            if !overwrite {
                match remote.stat(destination).await {
                    Ok(_) => exn::bail!(ErrorKind::Conflict(destination.to_path_buf())),
                    Err(err) if err.is_not_found() => {},
                    Err(err) => return Err(crate::error::storage(err)),
                }
            }
            upload(remote, ctx, source, destination, overwrite, progress).await
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastdbfs_storage::backend::MockBackend;

    #[tokio::test]
    async fn test_upload_conflict_checked_before_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("report.txt");
        std::fs::write(&local, b"fresh").unwrap();
        let remote = MockBackend::with_files([("b/report.txt", b"stale")]);

        let ctx = Context::default();
        let dest = Path::new("b/report.txt");
        let err = transfer_one(&remote, &ctx, Direction::Upload, &local, dest, false, None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        assert_eq!(remote.transfer_calls().await, 0);

        let written = transfer_one(&remote, &ctx, Direction::Upload, &local, dest, true, None).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(remote.contents("b/report.txt").await.unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_download_round_trip() {
        let remote = MockBackend::with_files([("a/data.json", br#"{"ok":true}"#)]);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("data.json");
        let ctx = Context::default();
        transfer_one(&remote, &ctx, Direction::Download, Path::new("a/data.json"), &local, false, None).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_upload_of_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockBackend::default();
        let err = transfer_one(&remote, &Context::default(), Direction::Upload, dir.path(), Path::new("x"), true, None)
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Io(_)));
        assert!(remote.paths().await.is_empty());
    }
}
