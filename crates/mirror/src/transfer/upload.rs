use crate::Context;
use crate::error::{ErrorKind, Result, storage};
use crate::transfer::{Progress, TransferProgress, transfer_failure};
use exn::ResultExt;
use fastdbfs_storage::{StorageBackend, WriteHandle};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Hidden sibling that receives the blocks before the final move.
fn temporary_path(final_path: &Path) -> PathBuf {
    let name = final_path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    final_path.with_file_name(format!(".{name}.fastdbfs-partial"))
}

/// Whether `name` is a transient object left by an interrupted upload or
/// replace, rather than a file anyone meant to store.
pub(crate) fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && (name.ends_with(".fastdbfs-partial") || name.ends_with(".fastdbfs-backup"))
}

/// Lifecycle of one [`UploadSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Appending,
    Closing,
    Moved,
    Aborting,
    Removed,
}

/// A chunked upload into a hidden temporary file next to its destination.
///
/// Readers of the final path see either the previous contents or the
/// complete new file: bytes only reach the final name through a single
/// rename once every block is written and the size checks out. Any failure
/// must be followed by [`abort`](Self::abort), which removes the partial
/// file.
pub struct UploadSession<'a> {
    backend: &'a dyn StorageBackend,
    handle: Option<WriteHandle>,
    final_path: PathBuf,
    temporary_path: PathBuf,
    bytes_written: u64,
    state: SessionState,
}

impl<'a> UploadSession<'a> {
    pub async fn open(backend: &'a dyn StorageBackend, final_path: &Path) -> Result<Self> {
        if let Some(parent) = final_path.parent() {
            backend.mkdir(parent).await.map_err(storage)?;
        }
        let temporary_path = temporary_path(final_path);
        let handle = backend.open_write(&temporary_path, true).await.map_err(storage)?;
        tracing::debug!(backend = backend.name(), path = %temporary_path.display(), "upload session opened");
        Ok(Self {
            backend,
            handle: Some(handle),
            final_path: final_path.to_path_buf(),
            temporary_path,
            bytes_written: 0,
            state: SessionState::Open,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let Some(handle) = self.handle.filter(|_| matches!(self.state, SessionState::Open | SessionState::Appending))
        else {
            exn::bail!(ErrorKind::TransferFailure(self.final_path.clone()));
        };
        self.state = SessionState::Appending;
        self.backend.append_block(handle, data).await.map_err(storage)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Close the temporary file, verify its size and move it into place.
    pub async fn commit(&mut self, overwrite: bool) -> Result<u64> {
        self.state = SessionState::Closing;
        if let Some(handle) = self.handle.take() {
            self.backend.close_write(handle).await.map_err(storage)?;
        }
        let written = self.backend.stat(&self.temporary_path).await.map_err(storage)?;
        if written.size != self.bytes_written {
            exn::bail!(ErrorKind::Corrupted {
                path: self.final_path.clone(),
                expected: self.bytes_written,
                actual: written.size,
            });
        }
        match self.backend.rename(&self.temporary_path, &self.final_path, overwrite).await {
            Ok(()) => {},
            Err(err) if matches!(&*err, fastdbfs_storage::error::ErrorKind::AlreadyExists(_)) => {
                return Err(err.raise(ErrorKind::Conflict(self.final_path.clone())));
            },
            Err(err) => return Err(storage(err)),
        }
        self.state = SessionState::Moved;
        Ok(self.bytes_written)
    }

    /// Release the write handle and delete the partial file.
    ///
    /// Cleanup failures are logged rather than returned; the caller is
    /// already reporting the error that caused the abort.
    pub async fn abort(&mut self) {
        if self.state == SessionState::Moved {
            return;
        }
        self.state = SessionState::Aborting;
        if let Some(handle) = self.handle.take()
            && let Err(err) = self.backend.abort_write(handle).await
        {
            tracing::debug!(path = %self.temporary_path.display(), "unable to release write handle: {err}");
        }
        match self.backend.delete(&self.temporary_path, false).await {
            Ok(()) => {},
            Err(err) if err.is_not_found() => {},
            Err(err) => {
                tracing::warn!(path = %self.temporary_path.display(), "unable to remove partial upload: {err}");
            },
        }
        self.state = SessionState::Removed;
    }
}

/// Upload one local file to `remote_path`.
///
/// Returns the number of bytes written. On any failure, including
/// cancellation, the partial remote file is removed and nothing appears at
/// `remote_path`. Cancellation and conflicts are reported as themselves;
/// everything else as [`ErrorKind::TransferFailure`].
pub async fn upload(
    backend: &dyn StorageBackend,
    ctx: &Context,
    local_path: &Path,
    remote_path: &Path,
    overwrite: bool,
    progress: Option<Progress<'_>>,
) -> Result<u64> {
    upload_inner(backend, ctx, local_path, remote_path, overwrite, progress)
        .await
        .map_err(|err| transfer_failure(err, remote_path))
}

async fn upload_inner(
    backend: &dyn StorageBackend,
    ctx: &Context,
    local_path: &Path,
    remote_path: &Path,
    overwrite: bool,
    progress: Option<Progress<'_>>,
) -> Result<u64> {
    let mut file = File::open(local_path).await.or_raise(|| ErrorKind::Io(local_path.to_path_buf()))?;
    let total = file.metadata().await.or_raise(|| ErrorKind::Io(local_path.to_path_buf()))?.len();

    let mut session = UploadSession::open(backend, remote_path).await?;
    let result = match pump(&mut session, &mut file, ctx, local_path, total, progress).await {
        Ok(()) => session.commit(overwrite).await,
        Err(err) => Err(err),
    };
    if result.is_err() {
        session.abort().await;
    } else {
        tracing::debug!(path = %remote_path.display(), bytes = session.bytes_written(), "upload complete");
    }
    result
}

async fn pump(
    session: &mut UploadSession<'_>,
    file: &mut File,
    ctx: &Context,
    local_path: &Path,
    total: u64,
    progress: Option<Progress<'_>>,
) -> Result<()> {
    let chunk_size = ctx.chunk_size.min(session.backend.max_block_size()).max(1);
    let mut buffer = vec![0; chunk_size];
    loop {
        if ctx.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        let filled = fill(file, &mut buffer).await.or_raise(|| ErrorKind::Io(local_path.to_path_buf()))?;
        if filled == 0 {
            return Ok(());
        }
        session.append(&buffer[..filled]).await?;
        if let Some(report) = progress {
            report(TransferProgress {
                bytes: session.bytes_written(),
                total,
            });
        }
        if filled < buffer.len() {
            return Ok(());
        }
    }
}

/// Read until `buffer` is full or the file ends.
async fn fill(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
