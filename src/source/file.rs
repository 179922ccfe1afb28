//! Directory-backed data source.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::path::{unescape_segment, VirtualPath, PATH_SEPARATOR};

/// A writable source rooted at a host directory.
#[derive(Debug, Clone)]
pub struct FileSource {
    base: PathBuf,
}

impl FileSource {
    /// Create a source rooted at `base`. The directory need not exist yet.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Root directory of this source.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Map a virtual path onto the host filesystem.
    ///
    /// Segments whose literal form would contain a separator are rejected so
    /// a single virtual segment never becomes several host components.
    pub(crate) fn host_path(&self, path: &VirtualPath) -> Option<PathBuf> {
        let mut resolved = self.base.clone();

        for segment in path.segments() {
            let literal = unescape_segment(segment);
            if literal.contains(PATH_SEPARATOR) || literal.contains('\0') {
                debug!(segment = %segment, "rejecting segment with embedded separator");
                return None;
            }
            resolved.push(literal);
        }

        Some(resolved)
    }

    pub(crate) fn paths(&self, path: &VirtualPath) -> Vec<String> {
        let Some(dir) = self.host_path(path) else {
            return Vec::new();
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut names: Vec<String> = entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn contains(&self, path: &VirtualPath) -> bool {
        self.host_path(path).is_some_and(|p| p.exists())
    }

    pub(crate) fn read(&self, path: &VirtualPath) -> Option<Box<dyn Read + Send>> {
        let file_path = self.host_path(path)?;
        if !file_path.is_file() {
            return None;
        }

        match File::open(&file_path) {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                debug!(path = %file_path.display(), error = %e, "failed to open file");
                None
            }
        }
    }

    pub(crate) fn write(&self, path: &VirtualPath) -> Option<Box<dyn Write + Send>> {
        if path.is_root() {
            return None;
        }
        let file_path = self.host_path(path)?;

        match prepare_regular_file(&file_path) {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                warn!(path = %file_path.display(), error = %e, "failed to open file for writing");
                None
            }
        }
    }

    pub(crate) fn delete(&self, path: &VirtualPath) -> bool {
        let Some(target) = self.host_path(path) else {
            return false;
        };

        let result = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else if target.exists() {
            fs::remove_file(&target)
        } else {
            return false;
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "failed to delete");
                false
            }
        }
    }

    pub(crate) fn subsource(&self, path: &VirtualPath) -> Option<FileSource> {
        self.host_path(path).map(FileSource::new)
    }
}

/// Open `path` for writing, replacing any directory in the way and creating
/// missing parents.
fn prepare_regular_file(path: &Path) -> io::Result<File> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}
