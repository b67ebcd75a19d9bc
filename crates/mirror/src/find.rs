use crate::Context;
use crate::error::Result;
use crate::walk::{WalkEvent, WalkOrder, Walker};
use async_stream::stream;
use fastdbfs_filter::RuleSet;
use fastdbfs_storage::{BackendHandle, DirEntry};
use futures::Stream;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    pub order: WalkOrder,
    /// Skip unlistable directories instead of failing.
    pub suppress_warnings: bool,
    /// Whether the caller intends to show sizes and times. Entries always
    /// carry both, so this only travels through to presentation.
    pub include_metadata: bool,
}

/// Events emitted by [`find`].
///
/// [`Selected`](Self::Selected) entries arrive in walk order, interleaved
/// with [`Warning`](Self::Warning)s for subtrees that could not be listed.
/// A listing failure without `suppress_warnings` ends the stream with an
/// error instead.
#[derive(Debug)]
pub enum FindEvent {
    Selected(DirEntry),
    Warning { path: PathBuf, message: String },
}

/// Stream every entry under `root` that `rules` selects.
///
/// Unselected directories are still descended into; rules only decide what
/// is reported.
pub fn find(
    backend: BackendHandle,
    ctx: &Context,
    root: impl Into<PathBuf>,
    rules: RuleSet,
    options: FindOptions,
) -> impl Stream<Item = Result<FindEvent>> + Send + 'static {
    let walker = Walker::new(backend, root)
        .order(options.order)
        .suppress_warnings(options.suppress_warnings)
        .listing_timeout(ctx.listing_timeout)
        .cancel_on(ctx.cancel.clone());

    stream! {
        for await event in walker.into_stream() {
            match event {
                Ok(WalkEvent::Entry(entry)) => {
                    if rules.evaluate(&entry) {
                        yield Ok(FindEvent::Selected(entry));
                    }
                },
                Ok(WalkEvent::Skipped { path, error }) => {
                    yield Ok(FindEvent::Warning { message: error.to_string(), path });
                },
                Err(err) => {
                    yield Err(err);
                    return;
                },
            }
        }
    }
}
