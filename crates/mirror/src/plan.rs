use crate::error::{ErrorKind, Result, storage};
use async_trait::async_trait;
use exn::ResultExt;
use fastdbfs_filter::RuleSet;
use fastdbfs_storage::{BackendHandle, DirEntry, FileInfo};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// What to do with one walked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Copy,
    /// The destination already holds an identical-looking file.
    SkipUnchanged,
    /// The entry was not selected by the rule set.
    SkipExcluded,
    /// The destination exists and may not be replaced.
    Conflict,
    /// Directories are mirrored regardless of selection.
    CreateDirectory,
}

/// A decision for one entry, ready for the transfer engine.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub action: Action,
    pub source: DirEntry,
    pub destination: PathBuf,
}

/// Looks up metadata on the destination side of a copy.
#[async_trait]
pub trait DestinationProbe: Send + Sync {
    /// Metadata for `path`, or `None` when nothing is there.
    async fn probe(&self, path: &Path) -> Result<Option<FileInfo>>;
}

/// Probes a storage backend (uploads).
pub struct RemoteProbe {
    backend: BackendHandle,
}
impl RemoteProbe {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl DestinationProbe for RemoteProbe {
    async fn probe(&self, path: &Path) -> Result<Option<FileInfo>> {
        match self.backend.stat(path).await {
            Ok(info) => Ok(Some(info)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(storage(err)),
        }
    }
}

/// Probes the local filesystem (downloads).
pub struct LocalProbe;

#[async_trait]
impl DestinationProbe for LocalProbe {
    async fn probe(&self, path: &Path) -> Result<Option<FileInfo>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).or_raise(|| ErrorKind::Io(path.to_path_buf())),
        };
        let modified: OffsetDateTime = metadata.modified().or_raise(|| ErrorKind::Io(path.to_path_buf()))?.into();
        Ok(Some(if metadata.is_dir() {
            FileInfo::dir(path, modified)
        } else {
            FileInfo::file(path, metadata.len(), modified)
        }))
    }
}

/// Decide what to do with `entry`, to be written at `destination`.
///
/// | entry                | destination        | overwrite | sync  | action          |
/// |----------------------|--------------------|-----------|-------|-----------------|
/// | directory            | any                | any       | any   | CreateDirectory |
/// | not selected         | any                | any       | any   | SkipExcluded    |
/// | file                 | absent             | any       | any   | Copy            |
/// | file                 | directory          | any       | any   | Conflict        |
/// | file                 | same size, newer   | any       | true  | SkipUnchanged   |
/// | file                 | differs            | any       | true  | Copy            |
/// | file                 | file               | true      | false | Copy            |
/// | file                 | file               | false     | false | Conflict        |
///
/// "Newer" means the destination's modification time is at or after the
/// source's. Rules are evaluated before the destination is probed, so an
/// excluded entry never costs a round trip.
pub async fn plan(
    entry: DirEntry,
    destination: PathBuf,
    rules: &RuleSet,
    probe: &dyn DestinationProbe,
    overwrite: bool,
    sync: bool,
) -> Result<TransferPlan> {
    let action = if entry.is_dir() {
        Action::CreateDirectory
    } else if !rules.evaluate(&entry) {
        Action::SkipExcluded
    } else {
        match probe.probe(&destination).await? {
            None => Action::Copy,
            Some(existing) if existing.is_dir => Action::Conflict,
            Some(existing) if sync => {
                if existing.size == entry.size() && existing.modified >= entry.modified() {
                    Action::SkipUnchanged
                } else {
                    Action::Copy
                }
            },
            Some(_) if overwrite => Action::Copy,
            Some(_) => Action::Conflict,
        }
    };
    tracing::trace!(relpath = %entry.relpath, ?action, "planned");
    Ok(TransferPlan {
        action,
        source: entry,
        destination,
    })
}
