use crate::Context;
use crate::error::{ErrorKind, Result, storage};
use crate::transfer::{Progress, TransferProgress, transfer_failure};
use exn::ResultExt;
use fastdbfs_storage::StorageBackend;
use std::path::Path;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Download `remote_path` into the local file `local_path`.
///
/// Bytes land in a hidden temporary file in the destination directory,
/// which is flushed, synced and then renamed over `local_path`. A failed or
/// cancelled download deletes the temporary file and leaves any existing
/// local file untouched.
pub async fn download(
    backend: &dyn StorageBackend,
    ctx: &Context,
    remote_path: &Path,
    local_path: &Path,
    overwrite: bool,
    progress: Option<Progress<'_>>,
) -> Result<u64> {
    download_inner(backend, ctx, remote_path, local_path, overwrite, progress)
        .await
        .map_err(|err| transfer_failure(err, local_path))
}

async fn download_inner(
    backend: &dyn StorageBackend,
    ctx: &Context,
    remote_path: &Path,
    local_path: &Path,
    overwrite: bool,
    progress: Option<Progress<'_>>,
) -> Result<u64> {
    let io_error = || ErrorKind::Io(local_path.to_path_buf());
    let info = backend.stat(remote_path).await.map_err(storage)?;
    if info.is_dir {
        let err = exn::Exn::from(fastdbfs_storage::error::ErrorKind::IsADirectory(remote_path.to_path_buf()));
        return Err(storage(err));
    }
    if !overwrite && tokio::fs::try_exists(local_path).await.or_raise(io_error)? {
        exn::bail!(ErrorKind::Conflict(local_path.to_path_buf()));
    }

    let parent = match local_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(parent).await.or_raise(io_error)?;
    let mut builder = tempfile::Builder::new();
    builder.prefix(".transferring-");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Same mode as a plain `File::create`, so the umask decides.
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    let temporary = builder.tempfile_in(parent).or_raise(io_error)?;
    // From here on, dropping `temporary` deletes the partial file.
    let (file, temporary): (std::fs::File, TempPath) = temporary.into_parts();
    let mut file = File::from_std(file);

    let total = info.size;
    let mut offset = 0;
    while offset < total {
        if ctx.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let remaining = usize::try_from(total - offset).unwrap_or(usize::MAX);
        let chunk = backend
            .read_range(remote_path, offset, ctx.chunk_size.min(remaining).max(1))
            .await
            .map_err(storage)?;
        if chunk.is_empty() {
            // The remote file shrank underneath us.
            exn::bail!(ErrorKind::Corrupted {
                path: remote_path.to_path_buf(),
                expected: total,
                actual: offset,
            });
        }
        file.write_all(&chunk).await.or_raise(io_error)?;
        offset += chunk.len() as u64;
        if let Some(report) = progress {
            report(TransferProgress { bytes: offset, total });
        }
    }
    file.flush().await.or_raise(io_error)?;
    file.sync_all().await.or_raise(io_error)?;
    drop(file);

    let persisted = if overwrite {
        temporary.persist(local_path)
    } else {
        temporary.persist_noclobber(local_path)
    };
    if let Err(err) = persisted {
        if err.error.kind() == std::io::ErrorKind::AlreadyExists {
            exn::bail!(ErrorKind::Conflict(local_path.to_path_buf()));
        }
        return Err(err.error).or_raise(io_error);
    }
    tracing::debug!(path = %local_path.display(), bytes = offset, "download complete");
    Ok(offset)
}
