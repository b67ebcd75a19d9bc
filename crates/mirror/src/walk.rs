use crate::error::{ErrorKind, Result};
use async_stream::stream;
use fastdbfs_storage::error::ErrorKind as StorageErrorKind;
use fastdbfs_storage::{BackendHandle, DirEntry, FileInfo, relative_to, validate_path};
use futures::Stream;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Traversal order for a [`Walker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WalkOrder {
    /// Pre-order: a directory's whole subtree comes before its next sibling.
    #[default]
    DepthFirst,
    /// Level by level: every entry at depth `n` comes before depth `n + 1`.
    BreadthFirst,
}

/// Items produced by [`Walker::into_stream`].
///
/// The root is always the first [`Entry`](Self::Entry), with relative path
/// `.`. A directory's own entry is yielded before anything inside it.
#[derive(Debug)]
pub enum WalkEvent {
    Entry(DirEntry),
    /// A directory could not be listed and its subtree was left out. Only
    /// produced when warnings are suppressed; otherwise the listing failure
    /// ends the stream as an error.
    Skipped { path: PathBuf, error: crate::error::Error },
}

/// Lazily enumerates every entry beneath a root on one backend.
///
/// Listing happens on demand as the stream is polled, so a consumer that
/// stops early never pays for the rest of the tree. Entries are never
/// filtered here; selection is the caller's business.
pub struct Walker {
    backend: BackendHandle,
    root: PathBuf,
    order: WalkOrder,
    suppress_warnings: bool,
    listing_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Walker {
    pub fn new(backend: BackendHandle, root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            root: root.into(),
            order: WalkOrder::default(),
            suppress_warnings: false,
            listing_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn order(mut self, order: WalkOrder) -> Self {
        self.order = order;
        self
    }

    /// Skip directories that fail to list instead of aborting the walk.
    pub fn suppress_warnings(mut self, suppress: bool) -> Self {
        self.suppress_warnings = suppress;
        self
    }

    pub fn listing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.listing_timeout = timeout;
        self
    }

    /// Stop producing entries once `cancel` fires.
    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<WalkEvent>> + Send + 'static {
        // `rustfmt` does not format macros that use braces. Wrap in parentheses!
        stream!({
            let root = match validate_path(&self.root) {
                Ok(root) => root,
                Err(err) => {
                    yield Err(err.raise(ErrorKind::ListingFailure(self.root.clone())));
                    return;
                },
            };
            let info = match self.backend.stat(&root).await {
                Ok(info) => info,
                Err(err) => {
                    yield Err(err.raise(ErrorKind::ListingFailure(root)));
                    return;
                },
            };
            let is_dir = info.is_dir;
            yield Ok(WalkEvent::Entry(DirEntry::new(".", info)));
            if !is_dir {
                return;
            }

            match self.order {
                WalkOrder::DepthFirst => {
                    // One pending sibling list per open directory.
                    let mut stack: Vec<VecDeque<FileInfo>> = Vec::new();
                    match self.list(&root).await {
                        Ok(children) => stack.push(children.into()),
                        Err(Some(event)) => {
                            yield event;
                            if !self.suppress_warnings {
                                return;
                            }
                        },
                        Err(None) => return,
                    }
                    while let Some(siblings) = stack.last_mut() {
                        let Some(info) = siblings.pop_front() else {
                            stack.pop();
                            continue;
                        };
                        let path = info.path.clone();
                        let is_dir = info.is_dir;
                        yield Ok(WalkEvent::Entry(self.entry(&root, info)));
                        if !is_dir {
                            continue;
                        }
                        match self.list(&path).await {
                            Ok(children) => stack.push(children.into()),
                            Err(Some(event)) => {
                                let fatal = event.is_err();
                                yield event;
                                if fatal {
                                    return;
                                }
                            },
                            Err(None) => return,
                        }
                    }
                },
                WalkOrder::BreadthFirst => {
                    let mut pending = VecDeque::from([root.clone()]);
                    while let Some(dir) = pending.pop_front() {
                        let children = match self.list(&dir).await {
                            Ok(children) => children,
                            Err(Some(event)) => {
                                let fatal = event.is_err();
                                yield event;
                                if fatal {
                                    return;
                                }
                                continue;
                            },
                            Err(None) => return,
                        };
                        for info in children {
                            if info.is_dir {
                                pending.push_back(info.path.clone());
                            }
                            yield Ok(WalkEvent::Entry(self.entry(&root, info)));
                        }
                    }
                },
            }
        })
    }

    fn entry(&self, root: &Path, info: FileInfo) -> DirEntry {
        DirEntry::new(relative_to(&info.path, root), info)
    }

    /// List one directory. On failure, returns the event to report: an
    /// `Err` that ends the walk, or a `Skipped` when warnings are
    /// suppressed. `Err(None)` means the walk was cancelled.
    async fn list(&self, dir: &Path) -> std::result::Result<Vec<FileInfo>, Option<Result<WalkEvent>>> {
        let listing = async {
            match self.listing_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.backend.list(dir)).await {
                    Ok(result) => result,
                    Err(_) => Err(exn::Exn::from(StorageErrorKind::Timeout)),
                },
                None => self.backend.list(dir).await,
            }
        };
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(None),
            result = listing => result,
        };
        let err = match result {
            Ok(children) => return Ok(children),
            Err(err) => err,
        };

        let kind = match &*err {
            StorageErrorKind::Timeout => ErrorKind::ListingTimeout(dir.to_path_buf()),
            _ => ErrorKind::ListingFailure(dir.to_path_buf()),
        };
        let error = err.raise(kind);
        if self.suppress_warnings {
            tracing::debug!(backend = self.backend.name(), path = %dir.display(), "skipping subtree: {error}");
            Err(Some(Ok(WalkEvent::Skipped { path: dir.to_path_buf(), error })))
        } else {
            tracing::warn!(backend = self.backend.name(), path = %dir.display(), "{error}");
            Err(Some(Err(error)))
        }
    }
}
