//! Virtual filesystem for game packages.
//!
//! A [`DataSource`] is an immutable view over one of a closed set of
//! backends. Every operation takes a slash-separated path relative to the
//! source root and resolves it first (see [`path`]); a path that escapes the
//! root turns the operation into a no-op instead of an error.

mod asset;
mod file;
pub mod path;
mod remote;

use std::io::{Read, Write};

use tracing::debug;

pub use asset::{AssetBundle, AssetSource};
pub use file::FileSource;
pub use path::{
    escape_name, escape_segment, resolve_path, unescape_segment, PathEscape, VirtualPath,
};
pub use remote::{HttpAccess, RemoteSource};

use crate::{HostError, Result};

/// A virtual filesystem rooted somewhere.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Host directory; the only writable backend.
    File(FileSource),
    /// Assets compiled into the host.
    Asset(AssetSource),
    /// Files below a base URL.
    Remote(RemoteSource),
    /// Ordered composition; earlier children take precedence.
    Union(Vec<DataSource>),
}

fn parse(relative: &str) -> Option<VirtualPath> {
    match VirtualPath::parse(relative) {
        Ok(path) => Some(path),
        Err(PathEscape) => {
            debug!(path = relative, "rejecting path that escapes its source");
            None
        }
    }
}

impl DataSource {
    /// Directory-backed source.
    pub fn file(base: impl Into<std::path::PathBuf>) -> Self {
        DataSource::File(FileSource::new(base))
    }

    /// Asset-backed source rooted at `base` inside `bundle`.
    pub fn asset(bundle: AssetBundle, base: &str) -> Self {
        DataSource::Asset(AssetSource::new(bundle, base))
    }

    /// URL-backed source.
    pub fn remote(base_url: &str, http: HttpAccess) -> Result<Self> {
        RemoteSource::new(base_url, http).map(DataSource::Remote)
    }

    /// Compose `self` with `others`; `self` takes precedence.
    pub fn union(self, others: impl IntoIterator<Item = DataSource>) -> Self {
        let mut sources = vec![self];
        sources.extend(others);
        DataSource::Union(sources)
    }

    /// Names of the entries directly below `relative`.
    pub fn paths(&self, relative: &str) -> Vec<String> {
        match parse(relative) {
            Some(path) => self.paths_at(&path),
            None => Vec::new(),
        }
    }

    fn paths_at(&self, path: &VirtualPath) -> Vec<String> {
        match self {
            DataSource::File(source) => source.paths(path),
            DataSource::Asset(source) => source.paths(path),
            DataSource::Remote(_) => Vec::new(),
            DataSource::Union(sources) => {
                let mut merged: Vec<String> = Vec::new();
                for name in sources.iter().flat_map(|s| s.paths_at(path)) {
                    if !merged.contains(&name) {
                        merged.push(name);
                    }
                }
                merged
            }
        }
    }

    /// Whether anything exists at `relative`.
    pub fn contains(&self, relative: &str) -> bool {
        parse(relative).is_some_and(|path| self.contains_at(&path))
    }

    fn contains_at(&self, path: &VirtualPath) -> bool {
        match self {
            DataSource::File(source) => source.contains(path),
            DataSource::Asset(source) => source.contains(path),
            DataSource::Remote(_) => false,
            DataSource::Union(sources) => sources.iter().any(|s| s.contains_at(path)),
        }
    }

    /// Open `relative` for reading.
    pub fn read(&self, relative: &str) -> Option<Box<dyn Read + Send>> {
        let path = parse(relative)?;
        self.read_at(&path)
    }

    fn read_at(&self, path: &VirtualPath) -> Option<Box<dyn Read + Send>> {
        match self {
            DataSource::File(source) => source.read(path),
            DataSource::Asset(source) => source.read(path),
            DataSource::Remote(source) => source.read(path),
            DataSource::Union(sources) => sources.iter().find_map(|s| s.read_at(path)),
        }
    }

    /// Read the whole of `relative`.
    pub fn read_bytes(&self, relative: &str) -> Option<Vec<u8>> {
        let mut reader = self.read(relative)?;
        let mut bytes = Vec::new();
        match reader.read_to_end(&mut bytes) {
            Ok(_) => Some(bytes),
            Err(e) => {
                debug!(path = relative, error = %e, "read failed midway");
                None
            }
        }
    }

    /// Read the whole of `relative` as UTF-8 text.
    pub fn read_to_string(&self, relative: &str) -> Result<String> {
        let bytes = self
            .read_bytes(relative)
            .ok_or_else(|| HostError::NotFound(relative.to_string()))?;
        String::from_utf8(bytes)
            .map_err(|e| HostError::Validation(format!("`{relative}` is not UTF-8: {e}")))
    }

    /// Whether this source can ever accept writes.
    pub fn can_write(&self) -> bool {
        match self {
            DataSource::File(_) => true,
            DataSource::Asset(_) | DataSource::Remote(_) => false,
            DataSource::Union(sources) => sources.iter().any(DataSource::can_write),
        }
    }

    /// Open `relative` for writing, creating or truncating it.
    pub fn write(&self, relative: &str) -> Option<Box<dyn Write + Send>> {
        let path = parse(relative)?;
        self.write_at(&path)
    }

    fn write_at(&self, path: &VirtualPath) -> Option<Box<dyn Write + Send>> {
        match self {
            DataSource::File(source) => source.write(path),
            DataSource::Asset(_) | DataSource::Remote(_) => None,
            DataSource::Union(sources) => sources.iter().find_map(|s| s.write_at(path)),
        }
    }

    /// Delete `relative`, recursively for directories.
    ///
    /// Returns whether anything was deleted.
    pub fn delete(&self, relative: &str) -> bool {
        parse(relative).is_some_and(|path| self.delete_at(&path))
    }

    fn delete_at(&self, path: &VirtualPath) -> bool {
        match self {
            DataSource::File(source) => source.delete(path),
            DataSource::Asset(_) | DataSource::Remote(_) => false,
            DataSource::Union(sources) => {
                if !self.can_write() {
                    return false;
                }
                let mut deleted = false;
                for source in sources {
                    deleted |= source.delete_at(path);
                }
                deleted
            }
        }
    }

    /// A new source rooted at `relative`.
    pub fn subsource(&self, relative: &str) -> Option<DataSource> {
        let path = parse(relative)?;
        self.subsource_at(&path)
    }

    fn subsource_at(&self, path: &VirtualPath) -> Option<DataSource> {
        match self {
            DataSource::File(source) => source.subsource(path).map(DataSource::File),
            DataSource::Asset(source) => source.subsource(path).map(DataSource::Asset),
            DataSource::Remote(source) => source.subsource(path).map(DataSource::Remote),
            DataSource::Union(sources) => {
                let children: Vec<DataSource> =
                    sources.iter().filter_map(|s| s.subsource_at(path)).collect();
                if children.is_empty() {
                    None
                } else {
                    Some(DataSource::Union(children))
                }
            }
        }
    }
}
