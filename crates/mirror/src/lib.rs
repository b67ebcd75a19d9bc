//! Recursive find and synchronised copy between a storage backend and the
//! local disk.
//!
//! The pieces stack up from the bottom: a [`Walker`](walk::Walker) turns a
//! directory tree into a stream of entries, the planner decides per entry
//! whether to copy, skip or flag a conflict, and the transfer engine moves
//! bytes in bounded chunks through a temporary file that only becomes
//! visible under its final name once it is complete.

pub mod copy;
pub mod error;
pub mod find;
pub mod plan;
pub mod transfer;
pub mod walk;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use crate::copy::{CopyEvent, CopyOptions, CopySummary, copy_tree, recursive_copy};
pub use crate::find::{FindEvent, FindOptions, find};
pub use crate::plan::{Action, DestinationProbe, LocalProbe, RemoteProbe, TransferPlan, plan};
pub use crate::transfer::{TransferProgress, download, transfer_one, upload};
pub use crate::walk::{WalkEvent, WalkOrder, Walker};

/// Default size of one transfer chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Which way bytes flow, relative to the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote to local disk.
    Download,
    /// Local disk to remote.
    Upload,
}

/// Settings shared by every operation in one invocation.
#[derive(Debug, Clone)]
pub struct Context {
    /// Preferred chunk size; uploads are further capped by the backend's block limit.
    pub chunk_size: usize,
    /// Limit on one whole listing, retries included; `None` waits forever.
    /// Backends behind a `RetryingBackend` should bound each attempt there
    /// instead, so backoff is not charged to the directory.
    pub listing_timeout: Option<Duration>,
    /// Cancelled when the user interrupts.
    pub cancel: CancellationToken,
}
impl Default for Context {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            listing_timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}
impl Context {
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn with_listing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.listing_timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
