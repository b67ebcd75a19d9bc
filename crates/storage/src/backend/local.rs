//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for the local filesystem.
//! Paths are resolved under a configured root directory and accessed using
//! `tokio::fs` for async I/O. It is the source tree for uploads, the target
//! tree for downloads, and backs the `local` profile kind.

use crate::backend::{WriteHandle, check_block_size};
use crate::error::ErrorKind;
use crate::{FileInfo, StorageBackend, error::Result, path::validate as validate_path};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

struct OpenWrite {
    path: PathBuf,
    file: File,
}

/// Local filesystem storage backend.
///
/// All paths are relative to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use fastdbfs_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/srv/mirror")?;
/// # Ok(())
/// # }
/// ```
pub struct LocalBackend {
    name: String,
    root: PathBuf,
    next_handle: AtomicU64,
    writes: Mutex<HashMap<u64, OpenWrite>>,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists and is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::NotADirectory(root));
            }
        } else {
            // Only happens once per profile; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        }

        Ok(Self {
            name: name.into(),
            root,
            next_handle: AtomicU64::new(1),
            writes: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the absolute path for a relative storage path.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn info(path: PathBuf, metadata: &Metadata) -> FileInfo {
        let modified = metadata.modified().map(OffsetDateTime::from).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        if metadata.is_dir() {
            FileInfo::dir(path, modified)
        } else {
            FileInfo::file(path, metadata.len(), modified)
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let relative = validate_path(path)?;
        let metadata = fs::metadata(self.root.join(&relative)).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(Self::info(relative, &metadata))
    }

    async fn list(&self, dir: &Path) -> Result<Vec<FileInfo>> {
        let relative = validate_path(dir)?;
        let absolute = self.root.join(&relative);
        let metadata = fs::metadata(&absolute).await.map_err(|e| ErrorKind::from_io(e, dir))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::NotADirectory(relative));
        }

        let mut entries = fs::read_dir(&absolute).await.map_err(|e| ErrorKind::from_io(e, dir))?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, dir))? {
            let child = relative.join(entry.file_name());
            let file_type = entry.file_type().await.map_err(|e| ErrorKind::from_io(e, &child))?;
            if !file_type.is_symlink() {
                let metadata = entry.metadata().await.map_err(|e| ErrorKind::from_io(e, &child))?;
                children.push(Self::info(child, &metadata));
                continue;
            }
            // Links to files are followed; links to directories are never descended.
            match fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_dir() => {
                    tracing::warn!(path = %child.display(), "skipping symlinked directory");
                },
                Ok(metadata) => children.push(Self::info(child, &metadata)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %child.display(), "skipping dangling symlink");
                },
                Err(err) => exn::bail!(ErrorKind::from_io(err, &child)),
            }
        }
        // read_dir order is filesystem-dependent.
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        fs::create_dir_all(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(())
    }

    async fn delete(&self, path: &Path, recursive: bool) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        if abs_path == self.root {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        }
        let metadata = fs::symlink_metadata(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let result = match (metadata.is_dir(), recursive) {
            (true, true) => fs::remove_dir_all(&abs_path).await,
            (true, false) => fs::remove_dir(&abs_path).await,
            (false, _) => fs::remove_file(&abs_path).await,
        };
        result.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path, overwrite: bool) -> Result<()> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(to)?;
        if !fs::try_exists(&from_path).await.map_err(|e| ErrorKind::from_io(e, from))? {
            exn::bail!(ErrorKind::NotFound(from.to_path_buf()));
        }
        if !overwrite && fs::try_exists(&to_path).await.map_err(|e| ErrorKind::from_io(e, to))? {
            exn::bail!(ErrorKind::AlreadyExists(to.to_path_buf()));
        }
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, to))?;
        }
        fs::rename(&from_path, &to_path).await.map_err(|e| ErrorKind::from_io(e, to))?;
        Ok(())
    }

    async fn open_write(&self, path: &Path, overwrite: bool) -> Result<WriteHandle> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?;

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.writes.lock().await.insert(id, OpenWrite { path: path.to_path_buf(), file });
        Ok(WriteHandle(id))
    }

    async fn append_block(&self, handle: WriteHandle, data: &[u8]) -> Result<()> {
        check_block_size(data, self.max_block_size())?;
        let mut writes = self.writes.lock().await;
        let open = writes.get_mut(&handle.0).ok_or(ErrorKind::InvalidHandle(handle.0))?;
        open.file.write_all(data).await.map_err(|e| ErrorKind::from_io(e, &open.path))?;
        Ok(())
    }

    async fn close_write(&self, handle: WriteHandle) -> Result<()> {
        let mut open = self.writes.lock().await.remove(&handle.0).ok_or(ErrorKind::InvalidHandle(handle.0))?;
        open.file.flush().await.map_err(|e| ErrorKind::from_io(e, &open.path))?;
        open.file.sync_all().await.map_err(|e| ErrorKind::from_io(e, &open.path))?;
        Ok(())
    }

    async fn abort_write(&self, handle: WriteHandle) -> Result<()> {
        // Dropping the file closes it; the partial contents stay for the caller to delete.
        self.writes.lock().await.remove(&handle.0).ok_or(ErrorKind::InvalidHandle(handle.0))?;
        Ok(())
    }

    async fn read_range(&self, path: &Path, offset: u64, length: usize) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        let mut file = File::open(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        if file.metadata().await.map_err(|e| ErrorKind::from_io(e, path))?.is_dir() {
            exn::bail!(ErrorKind::IsADirectory(path.to_path_buf()));
        }
        file.seek(SeekFrom::Start(offset)).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let mut buffer = Vec::with_capacity(length);
        file.take(length as u64).read_to_end(&mut buffer).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    async fn write(backend: &LocalBackend, path: &str, data: &[u8]) {
        let handle = backend.open_write(Path::new(path), true).await.unwrap();
        backend.append_block(handle, data).await.unwrap();
        backend.close_write(handle).await.unwrap();
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
        assert!(LocalBackend::new("name", "./relative").is_err());
    }

    #[test]
    fn test_absolute_path() {
        let (temp_dir, backend) = backend();
        let expected = temp_dir.path().join("FileStore/data.csv");
        assert_eq!(backend.absolute_path(Path::new("/FileStore/data.csv")).unwrap(), expected);
        // Path traversal is prevented
        assert!(backend.absolute_path(Path::new("../etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn test_chunked_write_and_read_range() {
        let (_temp_dir, backend) = backend();
        let handle = backend.open_write(Path::new("a/b/file.txt"), false).await.unwrap();
        backend.append_block(handle, b"0123456789").await.unwrap();
        backend.append_block(handle, b"ABCDEF").await.unwrap();
        backend.close_write(handle).await.unwrap();

        let path = Path::new("a/b/file.txt");
        assert_eq!(backend.read_range(path, 0, 4).await.unwrap(), b"0123");
        assert_eq!(backend.read_range(path, 10, 100).await.unwrap(), b"ABCDEF");
        assert!(backend.read_range(path, 16, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_write_without_overwrite() {
        let (_temp_dir, backend) = backend();
        write(&backend, "file.txt", b"data").await;
        let err = backend.open_write(Path::new("file.txt"), false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_handles_are_released() {
        let (_temp_dir, backend) = backend();
        let handle = backend.open_write(Path::new("file.txt"), true).await.unwrap();
        backend.abort_write(handle).await.unwrap();
        let err = backend.append_block(handle, b"late").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidHandle(_)));
        let err = backend.close_write(handle).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidHandle(_)));
    }

    #[tokio::test]
    async fn test_oversized_block_is_rejected() {
        let (_temp_dir, backend) = backend();
        let handle = backend.open_write(Path::new("big.bin"), true).await.unwrap();
        let block = vec![0u8; backend.max_block_size() + 1];
        assert!(backend.append_block(handle, &block).await.is_err());
    }

    #[tokio::test]
    async fn test_stat() {
        let (_temp_dir, backend) = backend();
        write(&backend, "dir/file.txt", b"Hello, world!").await;
        let info = backend.stat(Path::new("dir/file.txt")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("dir/file.txt"));
        assert_eq!(info.size, 13);
        assert!(!info.is_dir);
        let info = backend.stat(Path::new("dir")).await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.size, 0);
        let root = backend.stat(Path::new("/")).await.unwrap();
        assert!(root.is_dir);
        let err = backend.stat(Path::new("missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_direct_children() {
        let (_temp_dir, backend) = backend();
        write(&backend, "a/one.txt", b"1").await;
        write(&backend, "a/two.txt", b"22").await;
        write(&backend, "a/sub/three.txt", b"333").await;
        let mut children = backend.list(Path::new("a")).await.unwrap();
        children.sort_by(|x, y| x.path.cmp(&y.path));
        let paths: Vec<_> = children.iter().map(|c| c.path.to_string_lossy().into_owned()).collect();
        assert_eq!(paths, vec!["a/one.txt", "a/sub", "a/two.txt"]);
        assert!(children[1].is_dir);
        assert_eq!(children[2].size, 2);
    }

    #[tokio::test]
    async fn test_list_errors() {
        let (_temp_dir, backend) = backend();
        write(&backend, "file.txt", b"data").await;
        let err = backend.list(Path::new("file.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotADirectory(_)));
        let err = backend.list(Path::new("nonexistent")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_does_not_follow_directory_symlinks() {
        let (temp_dir, backend) = backend();
        write(&backend, "a/data.txt", b"data").await;
        std::os::unix::fs::symlink(temp_dir.path(), temp_dir.path().join("a/loop")).unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("a/data.txt"), temp_dir.path().join("a/alias.txt")).unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("gone"), temp_dir.path().join("a/dangling")).unwrap();

        let children = backend.list(Path::new("a")).await.unwrap();
        let paths: Vec<_> = children.iter().map(|c| c.path.to_string_lossy().into_owned()).collect();
        assert_eq!(paths, vec!["a/alias.txt", "a/data.txt"]);
        assert_eq!(children[0].size, 4);
        assert!(!children[0].is_dir);
    }

    #[tokio::test]
    async fn test_mkdir_is_idempotent() {
        let (_temp_dir, backend) = backend();
        backend.mkdir(Path::new("x/y/z")).await.unwrap();
        backend.mkdir(Path::new("x/y/z")).await.unwrap();
        assert!(backend.stat(Path::new("x/y")).await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, backend) = backend();
        write(&backend, "dir/file.txt", b"data").await;
        assert!(backend.delete(Path::new("dir"), false).await.is_err());
        backend.delete(Path::new("dir/file.txt"), false).await.unwrap();
        assert!(!backend.exists(Path::new("dir/file.txt")).await.unwrap());
        write(&backend, "dir/sub/file.txt", b"data").await;
        backend.delete(Path::new("dir"), true).await.unwrap();
        assert!(!backend.exists(Path::new("dir")).await.unwrap());
        let err = backend.delete(Path::new("nonexistent.txt"), false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        // The root itself can never be removed
        assert!(backend.delete(Path::new("/"), true).await.is_err());
    }

    #[tokio::test]
    async fn test_rename() {
        let (_temp_dir, backend) = backend();
        write(&backend, "old.txt", b"new data").await;
        write(&backend, "taken.txt", b"old data").await;
        let err = backend.rename(Path::new("old.txt"), Path::new("taken.txt"), false).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AlreadyExists(_)));
        assert_eq!(backend.read_range(Path::new("taken.txt"), 0, 100).await.unwrap(), b"old data");

        backend.rename(Path::new("old.txt"), Path::new("taken.txt"), true).await.unwrap();
        assert!(!backend.exists(Path::new("old.txt")).await.unwrap());
        assert_eq!(backend.read_range(Path::new("taken.txt"), 0, 100).await.unwrap(), b"new data");

        backend.rename(Path::new("taken.txt"), Path::new("a/b/c/file.txt"), false).await.unwrap();
        assert!(backend.exists(Path::new("a/b/c/file.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_temp_dir, backend) = backend();
        // Attempts to escape the root should fail
        assert!(backend.read_range(Path::new("../etc/passwd"), 0, 10).await.is_err());
        assert!(backend.stat(Path::new("etc/../../passwd")).await.is_err());
        assert!(backend.open_write(Path::new("../etc/passwd"), true).await.is_err());
        assert!(backend.delete(Path::new("../../file"), false).await.is_err());
    }
}
