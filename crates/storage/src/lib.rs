pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::{StorageBackend, WriteHandle};
pub use crate::models::{DirEntry, FileInfo};
pub use crate::path::{relative_to, to_absolute_string, validate as validate_path};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
