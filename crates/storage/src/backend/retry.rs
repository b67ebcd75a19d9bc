//! Throttling-aware retry decorator.
//!
//! Wraps another backend and retries calls that failed with a retryable
//! error (throttling, dropped connections) using exponential backoff. Every
//! clone shares one throttle gate, so a rate-limit response seen by one
//! caller slows down all of them instead of each hammering the API on its
//! own schedule.
//!
//! Listing limits are applied to each attempt on its own, so time spent
//! backing off never counts against a slow directory.

use crate::backend::WriteHandle;
use crate::error::{ErrorKind, Result};
use crate::{BackendHandle, FileInfo, StorageBackend};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How many times, and how patiently, to retry a throttled call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
}
impl RetryPolicy {
    /// Backoff before retry number `attempt` (zero-based): `initial * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Retrying storage backend.
#[derive(Clone)]
pub struct RetryingBackend {
    inner: BackendHandle,
    policy: RetryPolicy,
    listing_timeout: Option<Duration>,
    cancel: CancellationToken,
    /// No call may start before this instant.
    gate: Arc<Mutex<Option<Instant>>>,
}
impl RetryingBackend {
    pub fn new(inner: BackendHandle, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            listing_timeout: None,
            cancel: CancellationToken::new(),
            gate: Arc::new(Mutex::new(None)),
        }
    }

    /// Give each listing attempt at most `timeout`; an attempt that runs
    /// over fails with [`Timeout`](ErrorKind::Timeout) and is not retried.
    pub fn with_listing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.listing_timeout = timeout;
        self
    }

    /// Stop waiting on the throttle gate once `cancel` fires. Cleanup calls
    /// (`delete` and `abort_write`) keep waiting so they still get through.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns `false` if cancelled before the gate opened.
    async fn wait_for_gate(&self, interruptible: bool) -> bool {
        let Some(until) = *self.gate.lock().await else {
            return true;
        };
        if until <= Instant::now() {
            return true;
        }
        if !interruptible {
            tokio::time::sleep_until(until).await;
            return true;
        }
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep_until(until) => true,
        }
    }

    async fn push_gate(&self, delay: Duration) {
        let mut gate = self.gate.lock().await;
        let until = Instant::now() + delay;
        if gate.is_none_or(|current| current < until) {
            *gate = Some(until);
        }
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        self.run(op, true, call).await
    }

    /// Like [`retry()`](Self::retry), but never gives up on cancellation.
    async fn retry_cleanup<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        self.run(op, false, call).await
    }

    async fn run<T, F, Fut>(&self, op: &'static str, interruptible: bool, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if !self.wait_for_gate(interruptible).await {
            exn::bail!(ErrorKind::Interrupted);
        }
        let mut attempt = 0;
        loop {
            let err = match call().await {
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => err,
                result => return result,
            };
            let delay = self.policy.delay(attempt);
            tracing::warn!(
                backend = self.inner.name(),
                op,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "{err}; backing off"
            );
            self.push_gate(delay).await;
            attempt += 1;
            if !self.wait_for_gate(interruptible).await {
                tracing::debug!(backend = self.inner.name(), op, "cancelled while backing off");
                return Err(err.raise(ErrorKind::Interrupted));
            }
        }
    }

    async fn list_once(&self, dir: &Path) -> Result<Vec<FileInfo>> {
        let Some(limit) = self.listing_timeout else {
            return self.inner.list(dir).await;
        };
        match tokio::time::timeout(limit, self.inner.list(dir)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(backend = self.inner.name(), dir = %dir.display(), limit_secs = limit.as_secs(), "listing attempt timed out");
                exn::bail!(ErrorKind::Timeout)
            },
        }
    }
}

#[async_trait]
impl StorageBackend for RetryingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.retry("stat", || self.inner.stat(path)).await
    }

    async fn list(&self, dir: &Path) -> Result<Vec<FileInfo>> {
        self.retry("list", || self.list_once(dir)).await
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        self.retry("mkdir", || self.inner.mkdir(path)).await
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        self.retry_cleanup("delete", || self.inner.delete(path, recursive)).await
    }

    async fn rename(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        self.retry("rename", || self.inner.rename(from, to, overwrite)).await
    }

    async fn open_write(&self, path: &Path, overwrite: bool) -> Result<WriteHandle> {
        self.retry("open_write", || self.inner.open_write(path, overwrite)).await
    }

    async fn append_block(&self, handle: WriteHandle, data: &[u8]) -> Result<()> {
        self.retry("append_block", || self.inner.append_block(handle, data)).await
    }

    async fn close_write(&self, handle: WriteHandle) -> Result<()> {
        self.retry("close_write", || self.inner.close_write(handle)).await
    }

    async fn abort_write(&self, handle: WriteHandle) -> Result<()> {
        self.retry_cleanup("abort_write", || self.inner.abort_write(handle)).await
    }

    async fn read_range(&self, path: &Path, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.retry("read_range", || self.inner.read_range(path, offset, length)).await
    }

    fn max_block_size(&self) -> usize {
        self.inner.max_block_size()
    }
}
