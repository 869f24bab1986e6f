use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use serde::Serialize;

use crate::schema::Field;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileHandle {
    pub path: PathBuf,
}

impl FileHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Turns the text of a file-typed cell into a stored file reference.
///
/// An `Err` is reported as a validation error on the field; `Ok(None)` keeps
/// the original value.
pub trait FileResolver {
    fn resolve(&self, raw: &str, container: &str, field: &Field) -> Result<Option<FileHandle>>;
}

/// Resolves paths against a single root directory and refuses anything that
/// would land outside it.
#[derive(Debug, Clone)]
pub struct RootedFileResolver {
    root: PathBuf,
}

impl RootedFileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize(&root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileResolver for RootedFileResolver {
    fn resolve(&self, raw: &str, container: &str, field: &Field) -> Result<Option<FileHandle>> {
        if !field.datatype.is_file() {
            return Ok(None);
        }
        let candidate = Path::new(raw.trim());
        let joined = if candidate.is_absolute() {
            normalize(candidate)
        } else {
            normalize(&self.root.join(candidate))
        };
        if !joined.starts_with(&self.root) {
            bail!("Cannot reference file {raw} from container {container}");
        }
        Ok(Some(FileHandle::new(joined)))
    }
}

/// Lexically folds `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
