//! Storage models.
//!
//! [`FileInfo`] is what a backend reports about one node of its tree;
//! [`DirEntry`] is the same node as seen by a walk, carrying its path
//! relative to the walk root.

use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Node metadata returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Root-relative, normalised path (empty for the root directory)
    pub path: PathBuf,
    pub is_dir: bool,
    /// Size in bytes; always zero for directories
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
}
impl FileInfo {
    pub fn file(path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size,
            modified,
        }
    }

    pub fn dir(path: impl Into<PathBuf>, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            size: 0,
            modified,
        }
    }

    /// Final path component, or `/` for the root.
    pub fn basename(&self) -> String {
        basename(&self.path)
    }

    pub fn kind(&self) -> &'static str {
        if self.is_dir { "dir" } else { "file" }
    }
}

/// One node yielded by a tree walk.
///
/// Produced fresh per walk and never mutated afterwards; consumers copy
/// whatever fields they need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Path relative to the walk root (`.` for the root itself)
    pub relpath: String,
    pub info: FileInfo,
}
impl DirEntry {
    pub fn new(relpath: impl Into<String>, info: FileInfo) -> Self {
        Self { relpath: relpath.into(), info }
    }

    pub fn basename(&self) -> String {
        self.info.basename()
    }

    pub fn is_dir(&self) -> bool {
        self.info.is_dir
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn modified(&self) -> OffsetDateTime {
        self.info.modified
    }

    /// Number of components below the walk root (the root itself is 0).
    pub fn depth(&self) -> usize {
        if self.relpath == "." { 0 } else { Path::new(&self.relpath).components().count() }
    }
}

fn basename(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basename() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(FileInfo::file("a/b/photo.jpg", 3, now).basename(), "photo.jpg");
        assert_eq!(FileInfo::dir("a", now).basename(), "a");
        assert_eq!(FileInfo::dir("", now).basename(), "/");
    }

    #[test]
    fn test_depth() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(DirEntry::new(".", FileInfo::dir("x", now)).depth(), 0);
        assert_eq!(DirEntry::new("a", FileInfo::dir("x/a", now)).depth(), 1);
        assert_eq!(DirEntry::new("a/b/c.txt", FileInfo::file("x/a/b/c.txt", 1, now)).depth(), 3);
    }

    #[test]
    fn test_directories_have_no_size() {
        let info = FileInfo::dir("a", OffsetDateTime::UNIX_EPOCH);
        assert_eq!(info.size, 0);
        assert_eq!(info.kind(), "dir");
    }
}
