use crate::error::{Error, ErrorKind, Result, storage};
use crate::plan::{Action, DestinationProbe, LocalProbe, RemoteProbe, TransferPlan, plan};
use crate::transfer::{TransferProgress, download, is_staging_name, upload};
use crate::walk::{WalkEvent, Walker};
use crate::{Context, Direction};
use async_stream::stream;
use exn::ResultExt;
use fastdbfs_filter::RuleSet;
use fastdbfs_storage::BackendHandle;
use fastdbfs_storage::backend::LocalBackend;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Replace existing destination files.
    pub overwrite: bool,
    /// Only copy files whose destination is missing, a different size, or older.
    pub sync: bool,
    /// Log every transfer at info rather than debug.
    pub verbose: bool,
    /// Skip unlistable directories instead of failing.
    pub suppress_warnings: bool,
    /// Abort on the first conflict instead of reporting it and moving on.
    pub strict: bool,
}

/// Totals for one recursive copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub copied: u64,
    pub bytes: u64,
    pub directories: u64,
    pub skipped_unchanged: u64,
    pub skipped_excluded: u64,
    pub conflicts: u64,
    pub failed: u64,
    pub listing_failures: u64,
    /// Relative paths of the entries counted in `failed`.
    pub failures: Vec<String>,
}
impl CopySummary {
    /// No file failed to transfer.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Progress events emitted by [`copy_tree`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started), exactly once.
/// 2. One event per walked entry ([`Directory`](Self::Directory),
///    [`Copied`](Self::Copied), [`Skipped`](Self::Skipped),
///    [`Conflict`](Self::Conflict) or [`Failed`](Self::Failed)), plus a
///    [`Warning`](Self::Warning) for every skipped subtree, in walk order.
/// 3. [`Complete`](Self::Complete), exactly once.
///
/// A fatal error (an unlistable directory without `suppress_warnings`, a
/// conflict in strict mode, or cancellation) terminates the stream early,
/// in which case [`Complete`](Self::Complete) is never emitted.
#[derive(Debug)]
pub enum CopyEvent {
    Started { source: PathBuf, destination: PathBuf },
    /// A destination directory exists (it may have been created just now).
    Directory(PathBuf),
    Copied { relpath: String, destination: PathBuf, bytes: u64 },
    Skipped(TransferPlan),
    Conflict(PathBuf),
    /// One file failed; the copy carries on with the next entry.
    Failed { relpath: String, error: Error },
    Warning { path: PathBuf, message: String },
    Complete(CopySummary),
}

/// Stream a recursive copy of `source` to `destination`.
///
/// For [`Direction::Download`], `source` is a path on `remote` and
/// `destination` a local directory; for [`Direction::Upload`] it is the
/// other way round. Directories are always mirrored, files only when
/// `rules` selects them, and existing destination files are handled
/// according to `options`. Per-file failures are reported and counted
/// without stopping the copy.
pub fn copy_tree(
    remote: BackendHandle,
    ctx: Context,
    direction: Direction,
    source: impl Into<PathBuf>,
    destination: impl Into<PathBuf>,
    rules: RuleSet,
    options: CopyOptions,
) -> impl Stream<Item = Result<CopyEvent>> + Send + 'static {
    let source = source.into();
    let destination = destination.into();

    // `rustfmt` does not format macros that use braces. Wrap in parentheses!
    stream!({
        yield Ok(CopyEvent::Started {
            source: source.clone(),
            destination: destination.clone(),
        });

        // Uploads walk the local tree through the same accessor interface as
        // a remote one; `base` is the local directory walked paths hang off.
        let (walk_backend, walk_root, base, probe): (BackendHandle, PathBuf, PathBuf, Box<dyn DestinationProbe>) =
            match direction {
                Direction::Download => (remote.clone(), source.clone(), PathBuf::new(), Box::new(LocalProbe)),
                Direction::Upload => match local_tree(&source) {
                    Ok((local, root, base)) => (local, root, base, Box::new(RemoteProbe::new(remote.clone()))),
                    Err(err) => {
                        yield Err(err);
                        return;
                    },
                },
            };
        let walker = Walker::new(walk_backend, walk_root)
            .suppress_warnings(options.suppress_warnings)
            .listing_timeout(ctx.listing_timeout)
            .cancel_on(ctx.cancel.clone());

        let mut summary = CopySummary::default();
        let mut entries = std::pin::pin!(walker.into_stream());
        while let Some(event) = entries.next().await {
            let entry = match event {
                Ok(WalkEvent::Entry(entry)) => entry,
                Ok(WalkEvent::Skipped { path, error }) => {
                    summary.listing_failures += 1;
                    yield Ok(CopyEvent::Warning { message: error.to_string(), path });
                    continue;
                },
                Err(err) => {
                    yield Err(err);
                    return;
                },
            };
            if ctx.cancel.is_cancelled() {
                yield Err(exn::Exn::from(ErrorKind::Cancelled));
                return;
            }
            if direction == Direction::Download && !entry.is_dir() && is_staging_name(&entry.basename()) {
                tracing::debug!(relpath = %entry.relpath, "skipping leftover staging file");
                continue;
            }

            let target = join(&destination, &entry.relpath);
            let relpath = entry.relpath.clone();
            let planned = match plan(entry, target, &rules, probe.as_ref(), options.overwrite, options.sync).await {
                Ok(planned) => planned,
                Err(error) => {
                    tracing::warn!(%relpath, "unable to inspect destination: {error}");
                    summary.failed += 1;
                    summary.failures.push(relpath.clone());
                    yield Ok(CopyEvent::Failed { relpath, error });
                    continue;
                },
            };

            match planned.action {
                Action::CreateDirectory => match create_directory(&remote, direction, &planned.destination).await {
                    Ok(()) => {
                        summary.directories += 1;
                        yield Ok(CopyEvent::Directory(planned.destination));
                    },
                    Err(error) => {
                        tracing::warn!(%relpath, "unable to create directory: {error}");
                        summary.failed += 1;
                        summary.failures.push(relpath.clone());
                        yield Ok(CopyEvent::Failed { relpath, error });
                    },
                },
                Action::SkipExcluded => {
                    summary.skipped_excluded += 1;
                    yield Ok(CopyEvent::Skipped(planned));
                },
                Action::SkipUnchanged => {
                    tracing::debug!(%relpath, "unchanged, skipping");
                    summary.skipped_unchanged += 1;
                    yield Ok(CopyEvent::Skipped(planned));
                },
                Action::Conflict => {
                    summary.conflicts += 1;
                    if options.strict {
                        yield Err(exn::Exn::from(ErrorKind::Conflict(planned.destination)));
                        return;
                    }
                    if !options.suppress_warnings {
                        tracing::warn!(path = %planned.destination.display(), "destination exists, not copying");
                    }
                    yield Ok(CopyEvent::Conflict(planned.destination));
                },
                Action::Copy => {
                    let overwrite = options.overwrite || options.sync;
                    let source_path = match direction {
                        Direction::Download => planned.source.info.path.clone(),
                        Direction::Upload => base.join(&planned.source.info.path),
                    };
                    let verbose = options.verbose;
                    let report = |p: TransferProgress| {
                        if verbose {
                            tracing::info!(%relpath, bytes = p.bytes, total = p.total, "transferring");
                        } else {
                            tracing::debug!(%relpath, bytes = p.bytes, total = p.total, "transferring");
                        }
                    };
                    let result = match direction {
                        Direction::Download => {
                            download(remote.as_ref(), &ctx, &source_path, &planned.destination, overwrite, Some(&report)).await
                        },
                        Direction::Upload => {
                            upload(remote.as_ref(), &ctx, &source_path, &planned.destination, overwrite, Some(&report)).await
                        },
                    };
                    match result {
                        Ok(bytes) => {
                            if verbose {
                                tracing::info!(%relpath, bytes, "copied");
                            } else {
                                tracing::debug!(%relpath, bytes, "copied");
                            }
                            summary.copied += 1;
                            summary.bytes += bytes;
                            yield Ok(CopyEvent::Copied {
                                relpath,
                                destination: planned.destination,
                                bytes,
                            });
                        },
                        Err(error) if matches!(&*error, ErrorKind::Cancelled) => {
                            yield Err(error);
                            return;
                        },
                        // Something appeared at the destination after it was probed.
                        Err(error) if matches!(&*error, ErrorKind::Conflict(_)) => {
                            summary.conflicts += 1;
                            if options.strict {
                                yield Err(error);
                                return;
                            }
                            yield Ok(CopyEvent::Conflict(planned.destination));
                        },
                        Err(error) => {
                            tracing::warn!(%relpath, "{error}");
                            summary.failed += 1;
                            summary.failures.push(relpath.clone());
                            yield Ok(CopyEvent::Failed { relpath, error });
                        },
                    }
                },
            }
        }

        tracing::info!(
            copied = summary.copied,
            bytes = summary.bytes,
            skipped = summary.skipped_unchanged + summary.skipped_excluded,
            conflicts = summary.conflicts,
            failed = summary.failed,
            "copy complete"
        );
        yield Ok(CopyEvent::Complete(summary));
    })
}

/// Run [`copy_tree`] to completion and return its summary.
pub async fn recursive_copy(
    remote: BackendHandle,
    ctx: Context,
    direction: Direction,
    source: impl Into<PathBuf>,
    destination: impl Into<PathBuf>,
    rules: RuleSet,
    options: CopyOptions,
) -> Result<CopySummary> {
    let mut events = std::pin::pin!(copy_tree(remote, ctx, direction, source, destination, rules, options));
    while let Some(event) = events.next().await {
        if let CopyEvent::Complete(summary) = event? {
            return Ok(summary);
        }
    }
    // The stream only ends without a summary after yielding an error.
    exn::bail!(ErrorKind::Cancelled)
}

/// Open a local source for walking: the backend, the walk root within it,
/// and the absolute directory the backend is rooted at. A single file is
/// walked from its parent directory.
fn local_tree(source: &Path) -> Result<(BackendHandle, PathBuf, PathBuf)> {
    let absolute = std::path::absolute(source).or_raise(|| ErrorKind::Io(source.to_path_buf()))?;
    let (base, root) = match (absolute.is_file(), absolute.parent(), absolute.file_name()) {
        (true, Some(parent), Some(name)) => (parent.to_path_buf(), PathBuf::from(name)),
        _ => (absolute, PathBuf::new()),
    };
    let backend = LocalBackend::new("local", &base)
        .map_err(|err| err.raise(ErrorKind::ListingFailure(source.to_path_buf())))?;
    Ok((Arc::new(backend), root, base))
}

/// Destination path for a walked entry; the walk root maps onto `destination` itself.
fn join(destination: &Path, relpath: &str) -> PathBuf {
    if relpath == "." { destination.to_path_buf() } else { destination.join(relpath) }
}

async fn create_directory(remote: &BackendHandle, direction: Direction, path: &Path) -> Result<()> {
    match direction {
        Direction::Download => tokio::fs::create_dir_all(path).await.or_raise(|| ErrorKind::Io(path.to_path_buf())),
        Direction::Upload => remote.mkdir(path).await.map_err(storage),
    }
}
