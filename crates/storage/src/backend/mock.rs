//! In-memory storage backend for testing.

use crate::backend::{WriteHandle, check_block_size};
use crate::error::{ErrorKind, Result};
use crate::models::FileInfo;
use crate::path::validate as validate_path;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::StorageBackend;

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    modified: OffsetDateTime,
    data: Vec<u8>,
}
impl Node {
    fn dir() -> Self {
        Self {
            is_dir: true,
            modified: OffsetDateTime::now_utc(),
            data: Vec::new(),
        }
    }

    fn file(data: Vec<u8>) -> Self {
        Self {
            is_dir: false,
            modified: OffsetDateTime::now_utc(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ListingFault {
    Fail,
    Timeout,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    handles: HashMap<u64, PathBuf>,
    next_handle: u64,
    calls: HashMap<&'static str, usize>,
    throttled_calls: usize,
    appends_before_failure: Option<usize>,
    listing_faults: HashMap<PathBuf, ListingFault>,
    rename_faults: HashSet<PathBuf>,
}
impl State {
    /// Count the call and apply any pending throttling.
    fn enter(&mut self, op: &'static str) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if self.throttled_calls > 0 {
            self.throttled_calls -= 1;
            exn::bail!(ErrorKind::Throttled);
        }
        Ok(())
    }

    fn node(&self, path: &Path) -> Result<&Node> {
        self.nodes.get(path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.to_path_buf())))
    }

    fn create_parents(&mut self, path: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = path.parent();
        while let Some(dir) = current {
            match self.nodes.get(dir) {
                Some(node) if node.is_dir => break,
                Some(_) => exn::bail!(ErrorKind::NotADirectory(dir.to_path_buf())),
                None => missing.push(dir.to_path_buf()),
            }
            current = dir.parent();
        }
        for dir in missing {
            self.nodes.insert(dir, Node::dir());
        }
        Ok(())
    }

    fn descendants(&self, path: &Path) -> Vec<PathBuf> {
        self.nodes.keys().filter(|p| *p != path && p.starts_with(path)).cloned().collect()
    }

    fn info(path: &Path, node: &Node) -> FileInfo {
        if node.is_dir {
            FileInfo::dir(path, node.modified)
        } else {
            FileInfo::file(path, node.data.len() as u64, node.modified)
        }
    }
}

/// In-memory storage backend for testing.
///
/// The tree lives in a `BTreeMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. Like DBFS,
/// appended blocks are visible at the write path immediately.
///
/// Besides storage it offers fault injection (throttling, failing appends,
/// failing renames, slow or broken listings) and per-operation call counters so tests
/// can assert what the code under test actually asked the backend to do.
///
/// # Examples
///
/// ```
/// use fastdbfs_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("tables/2024/part-0001.parquet", b"PAR1"),
/// ]);
/// assert!(backend.exists(Path::new("tables/2024")).await?);
/// assert_eq!(backend.calls("stat").await, 1);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    max_block_size: usize,
    listing_delay: Option<Duration>,
    state: RwLock<State>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files. Parent directories
    /// are created implicitly.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut state = State::default();
        state.nodes.insert(PathBuf::new(), Node::dir());
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            if state.create_parents(&validated).is_err() {
                panic!("MockBackend::with_files: parent of {} is a file", path.display());
            }
            state.nodes.insert(validated, Node::file(data.into()));
        }
        Self {
            name: "mock".to_string(),
            max_block_size: super::DEFAULT_MAX_BLOCK_SIZE,
            listing_delay: None,
            state: RwLock::new(state),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    /// Answer the next `calls` trait calls (of any kind) with `Throttled`.
    pub fn with_throttled_calls(mut self, calls: usize) -> Self {
        self.state.get_mut().throttled_calls = calls;
        self
    }

    /// Let `appends` blocks through, then fail every later append.
    pub fn with_failing_appends_after(mut self, appends: usize) -> Self {
        self.state.get_mut().appends_before_failure = Some(appends);
        self
    }

    /// Make every listing of `dir` fail with a backend error.
    pub fn with_failing_listing(mut self, dir: impl AsRef<Path>) -> Self {
        self.add_listing_fault(dir.as_ref(), ListingFault::Fail);
        self
    }

    /// Make every listing of `dir` time out.
    pub fn with_listing_timeout(mut self, dir: impl AsRef<Path>) -> Self {
        self.add_listing_fault(dir.as_ref(), ListingFault::Timeout);
        self
    }

    /// Sleep for `delay` before answering each listing.
    pub fn with_listing_delay(mut self, delay: Duration) -> Self {
        self.listing_delay = Some(delay);
        self
    }

    /// Make every rename whose source is `from` fail with a backend error.
    pub fn with_failing_rename(mut self, from: impl AsRef<Path>) -> Self {
        let Ok(validated) = validate_path(from.as_ref()) else {
            panic!("MockBackend: invalid rename fault path {}", from.as_ref().display());
        };
        self.state.get_mut().rename_faults.insert(validated);
        self
    }

    fn add_listing_fault(&mut self, dir: &Path, fault: ListingFault) {
        let Ok(validated) = validate_path(dir) else {
            panic!("MockBackend: invalid listing fault path {}", dir.display());
        };
        self.state.get_mut().listing_faults.insert(validated, fault);
    }

    /// Throttle the next `calls` trait calls on an already shared backend.
    pub async fn throttle_next(&self, calls: usize) {
        self.state.write().await.throttled_calls = calls;
    }

    /// Number of times the named trait method was called (throttled calls included).
    pub async fn calls(&self, op: &str) -> usize {
        self.state.read().await.calls.get(op).copied().unwrap_or(0)
    }

    /// Calls that move file content: opening, appending, closing and reading.
    pub async fn transfer_calls(&self) -> usize {
        let state = self.state.read().await;
        ["open_write", "append_block", "close_write", "read_range"]
            .iter()
            .map(|op| state.calls.get(op).copied().unwrap_or(0))
            .sum()
    }

    /// Raw contents of a file, bypassing counters and faults.
    pub async fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let path = validate_path(path.as_ref()).ok()?;
        self.state.read().await.nodes.get(&path).filter(|n| !n.is_dir).map(|n| n.data.clone())
    }

    /// All paths currently stored, root excluded, in sorted order.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.state.read().await.nodes.keys().filter(|p| !p.as_os_str().is_empty()).cloned().collect()
    }

    pub async fn set_modified(&self, path: impl AsRef<Path>, modified: OffsetDateTime) {
        let Ok(path) = validate_path(path.as_ref()) else { return };
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.get_mut(&path) {
            node.modified = modified;
        }
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let mut state = self.state.write().await;
        state.enter("stat")?;
        let node = state.node(&path)?;
        Ok(State::info(&path, node))
    }

    async fn list(&self, dir: &Path) -> Result<Vec<FileInfo>> {
        let dir = validate_path(dir)?;
        if let Some(delay) = self.listing_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.write().await;
        state.enter("list")?;
        match state.listing_faults.get(&dir) {
            Some(ListingFault::Fail) => exn::bail!(ErrorKind::BackendError(format!("listing {} failed", dir.display()))),
            Some(ListingFault::Timeout) => exn::bail!(ErrorKind::Timeout),
            None => {},
        }
        if !state.node(&dir)?.is_dir {
            exn::bail!(ErrorKind::NotADirectory(dir));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(path, _)| !path.as_os_str().is_empty() && path.parent() == Some(dir.as_path()))
            .map(|(path, node)| State::info(path, node))
            .collect())
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        let mut state = self.state.write().await;
        state.enter("mkdir")?;
        match state.nodes.get(&path) {
            Some(node) if node.is_dir => Ok(()),
            Some(_) => exn::bail!(ErrorKind::AlreadyExists(path)),
            None => {
                state.create_parents(&path)?;
                state.nodes.insert(path, Node::dir());
                Ok(())
            },
        }
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        let path = validate_path(path)?;
        let mut state = self.state.write().await;
        state.enter("delete")?;
        if path.as_os_str().is_empty() {
            exn::bail!(ErrorKind::InvalidPath(path));
        }
        state.node(&path)?;
        let descendants = state.descendants(&path);
        if !descendants.is_empty() && !recursive {
            exn::bail!(ErrorKind::BackendError(format!("directory not empty: {}", path.display())));
        }
        for child in descendants {
            state.nodes.remove(&child);
        }
        state.nodes.remove(&path);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        let mut state = self.state.write().await;
        state.enter("rename")?;
        state.node(&from)?;
        if state.rename_faults.contains(&from) {
            exn::bail!(ErrorKind::BackendError(format!("injected rename failure: {}", from.display())));
        }
        if state.nodes.contains_key(&to) {
            if !overwrite {
                exn::bail!(ErrorKind::AlreadyExists(to));
            }
            for child in state.descendants(&to) {
                state.nodes.remove(&child);
            }
            state.nodes.remove(&to);
        }
        state.create_parents(&to)?;
        let mut moved = state.descendants(&from);
        moved.push(from.clone());
        for old in moved {
            if let Some(node) = state.nodes.remove(&old) {
                let suffix = old.strip_prefix(&from).map(Path::to_path_buf).unwrap_or_default();
                let new = if suffix.as_os_str().is_empty() { to.clone() } else { to.join(suffix) };
                state.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn open_write(&self, path: &Path, overwrite: bool) -> Result<WriteHandle> {
        let path = validate_path(path)?;
        let mut state = self.state.write().await;
        state.enter("open_write")?;
        match state.nodes.get(&path) {
            Some(node) if node.is_dir => exn::bail!(ErrorKind::IsADirectory(path)),
            Some(_) if !overwrite => exn::bail!(ErrorKind::AlreadyExists(path)),
            _ => {},
        }
        state.create_parents(&path)?;
        state.nodes.insert(path.clone(), Node::file(Vec::new()));
        state.next_handle += 1;
        let id = state.next_handle;
        state.handles.insert(id, path);
        Ok(WriteHandle(id))
    }

    async fn append_block(&self, handle: WriteHandle, data: &[u8]) -> Result<()> {
        check_block_size(data, self.max_block_size)?;
        let mut state = self.state.write().await;
        state.enter("append_block")?;
        let path = state.handles.get(&handle.0).cloned().ok_or(ErrorKind::InvalidHandle(handle.0))?;
        if let Some(remaining) = state.appends_before_failure.as_mut() {
            if *remaining == 0 {
                exn::bail!(ErrorKind::BackendError("injected append failure".to_string()));
            }
            *remaining -= 1;
        }
        let node = state.nodes.get_mut(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        node.data.extend_from_slice(data);
        node.modified = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn close_write(&self, handle: WriteHandle) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("close_write")?;
        state.handles.remove(&handle.0).ok_or(ErrorKind::InvalidHandle(handle.0))?;
        Ok(())
    }

    async fn abort_write(&self, handle: WriteHandle) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter("abort_write")?;
        state.handles.remove(&handle.0).ok_or(ErrorKind::InvalidHandle(handle.0))?;
        Ok(())
    }

    async fn read_range(&self, path: &Path, offset: u64, length: usize) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let mut state = self.state.write().await;
        state.enter("read_range")?;
        let node = state.node(&path)?;
        if node.is_dir {
            exn::bail!(ErrorKind::IsADirectory(path));
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(node.data.len());
        let end = start.saturating_add(length).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    fn max_block_size(&self) -> usize {
        self.max_block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(backend: &MockBackend, path: &str, data: &[u8]) {
        let handle = backend.open_write(Path::new(path), true).await.unwrap();
        backend.append_block(handle, data).await.unwrap();
        backend.close_write(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_with_files_creates_parents() {
        let backend = MockBackend::with_files([("a/b/file.csv", b"x")]);
        assert!(backend.stat(Path::new("a")).await.unwrap().is_dir);
        assert!(backend.stat(Path::new("a/b")).await.unwrap().is_dir);
        assert_eq!(backend.stat(Path::new("a/b/file.csv")).await.unwrap().size, 1);
        assert!(!backend.exists(Path::new("c/nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_direct_children_only() {
        let backend = MockBackend::with_files([("a/one", b"1"), ("a/sub/two", b"2"), ("b/three", b"3")]);
        let children = backend.list(Path::new("a")).await.unwrap();
        let paths: Vec<_> = children.iter().map(|c| c.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("a/one"), PathBuf::from("a/sub")]);
        let root = backend.list(Path::new("/")).await.unwrap();
        assert_eq!(root.len(), 2);
    }

    #[tokio::test]
    async fn test_appends_are_visible_before_close() {
        let backend = MockBackend::default();
        let handle = backend.open_write(Path::new("tmp/part"), true).await.unwrap();
        backend.append_block(handle, b"abc").await.unwrap();
        assert_eq!(backend.contents("tmp/part").await.unwrap(), b"abc");
        backend.abort_write(handle).await.unwrap();
        assert!(backend.append_block(handle, b"def").await.is_err());
    }

    #[tokio::test]
    async fn test_read_range() {
        let backend = MockBackend::with_files([("file.txt", b"0123456789")]);
        let path = Path::new("file.txt");
        assert_eq!(backend.read_range(path, 2, 3).await.unwrap(), b"234");
        assert_eq!(backend.read_range(path, 8, 100).await.unwrap(), b"89");
        assert!(backend.read_range(path, 50, 10).await.unwrap().is_empty());
        let err = backend.read_range(Path::new("missing"), 0, 1).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let backend = MockBackend::with_files([("dir/file.txt", b"data")]);
        let err = backend.delete(Path::new("dir"), false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BackendError(_)));
        backend.delete(Path::new("dir"), true).await.unwrap();
        assert!(backend.paths().await.is_empty());
        let err = backend.delete(Path::new("dir"), false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rename_moves_subtree() {
        let backend = MockBackend::with_files([("old/a.txt", b"a"), ("old/sub/b.txt", b"b"), ("taken", b"t")]);
        backend.rename(Path::new("old"), Path::new("new/place"), false).await.unwrap();
        assert_eq!(backend.contents("new/place/sub/b.txt").await.unwrap(), b"b");
        assert!(!backend.exists(Path::new("old")).await.unwrap());

        let err = backend.rename(Path::new("new/place/a.txt"), Path::new("taken"), false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        backend.rename(Path::new("new/place/a.txt"), Path::new("taken"), true).await.unwrap();
        assert_eq!(backend.contents("taken").await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_failing_rename_leaves_both_paths() {
        let backend = MockBackend::with_files([("tmp", b"new"), ("dest", b"old")]).with_failing_rename("tmp");
        assert!(backend.rename(Path::new("tmp"), Path::new("dest"), true).await.is_err());
        assert_eq!(backend.contents("dest").await.unwrap(), b"old");
        assert_eq!(backend.contents("tmp").await.unwrap(), b"new");
        backend.rename(Path::new("dest"), Path::new("moved"), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_throttling_and_counters() {
        let backend = MockBackend::with_files([("f", b"1")]).with_throttled_calls(2);
        for _ in 0..2 {
            let err = backend.stat(Path::new("f")).await.unwrap_err();
            assert!(matches!(&*err, ErrorKind::Throttled));
        }
        assert!(backend.stat(Path::new("f")).await.is_ok());
        assert_eq!(backend.calls("stat").await, 3);
        assert_eq!(backend.transfer_calls().await, 0);
    }

    #[tokio::test]
    async fn test_failing_appends() {
        let backend = MockBackend::default().with_failing_appends_after(2);
        let handle = backend.open_write(Path::new("f"), true).await.unwrap();
        backend.append_block(handle, b"1").await.unwrap();
        backend.append_block(handle, b"2").await.unwrap();
        assert!(backend.append_block(handle, b"3").await.is_err());
        assert_eq!(backend.contents("f").await.unwrap(), b"12");
    }

    #[tokio::test]
    async fn test_listing_faults() {
        let backend = MockBackend::with_files([("slow/a", b""), ("broken/b", b"")])
            .with_listing_timeout("slow")
            .with_failing_listing("/broken");
        let err = backend.list(Path::new("slow")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Timeout));
        let err = backend.list(Path::new("broken")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BackendError(_)));
        assert_eq!(backend.list(Path::new("")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_modified() {
        let backend = MockBackend::default();
        write(&backend, "f", b"data").await;
        backend.set_modified("f", OffsetDateTime::UNIX_EPOCH).await;
        assert_eq!(backend.stat(Path::new("f")).await.unwrap().modified, OffsetDateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let backend = MockBackend::default();
        assert!(backend.stat(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.open_write(Path::new("../escape"), true).await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
