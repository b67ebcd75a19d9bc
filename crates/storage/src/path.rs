//! Path validation and normalisation.
//!
//! Every backend addresses its tree with root-relative paths. This module
//! turns whatever the user typed (`/a/b`, `a//b/`, `a/./c/../b`) into one
//! canonical form and refuses anything that would leave the root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a storage path and returns it normalised and root-relative.
///
/// A leading `/` is accepted and dropped: remote stores present absolute
/// POSIX paths but backends treat them relative to their root. The empty
/// result denotes the root directory itself.
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use fastdbfs_storage::validate_path;
/// assert_eq!(validate_path("/data/raw/").unwrap(), Path::new("data/raw"));
/// assert_eq!(validate_path("a/../b").unwrap(), Path::new("b"));
/// assert_eq!(validate_path("/").unwrap(), Path::new(""));
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Path::components() lets null bytes through on Unix.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    Ok(components.into_iter().collect())
}

/// Render a root-relative path the way remote APIs want it: absolute, `/`
/// separated, with `/` for the root.
pub fn to_absolute_string(path: &Path) -> String {
    let mut out = String::from("/");
    let parts: Vec<_> = path.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    out.push_str(&parts.join("/"));
    out
}

/// Express `path` relative to `root`, using `.` for the root itself.
///
/// Both arguments are expected to be validated already. A path outside
/// `root` is returned unchanged.
pub fn relative_to(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Fandom/work.html", "Fandom/work.html")]
    #[case("/dbfs/tmp/data.csv", "dbfs/tmp/data.csv")]
    #[case("a//b//c", "a/b/c")]
    #[case("a/./b/./c", "a/b/c")]
    #[case("a/b/..", "a")]
    #[case("Fandom1///", "Fandom1")]
    #[case("/", "")]
    #[case(".", "")]
    #[case("", "")]
    fn test_valid_paths(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(input).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("/../x")]
    #[case("a\0b")]
    fn test_invalid_paths(#[case] input: &str) {
        let err = validate(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[rstest]
    #[case("", "/")]
    #[case("a", "/a")]
    #[case("a/b/c.txt", "/a/b/c.txt")]
    fn test_absolute_string(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(to_absolute_string(Path::new(input)), expected);
    }

    #[rstest]
    #[case("a/b", "a/b", ".")]
    #[case("a/b/c", "a/b", "c")]
    #[case("a/b/c/d.txt", "a", "b/c/d.txt")]
    #[case("x/y", "", "x/y")]
    #[case("other/y", "a", "other/y")]
    fn test_relative_to(#[case] path: &str, #[case] root: &str, #[case] expected: &str) {
        assert_eq!(relative_to(Path::new(path), Path::new(root)), expected);
    }
}
