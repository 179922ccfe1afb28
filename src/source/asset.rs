//! Read-only data source over assets bundled into the host binary.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::sync::Arc;

use super::path::{VirtualPath, PATH_SEPARATOR};

/// An immutable set of files keyed by slash-separated path.
#[derive(Debug, Clone, Default)]
pub struct AssetBundle {
    files: Arc<BTreeMap<String, Cow<'static, [u8]>>>,
}

impl AssetBundle {
    /// Build a bundle from `(path, contents)` pairs.
    pub fn new<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<Cow<'static, [u8]>>,
    {
        let files = files
            .into_iter()
            .map(|(path, contents)| (path.into(), contents.into()))
            .collect();

        Self {
            files: Arc::new(files),
        }
    }

    /// Lua modules shipped with the host and visible to every game.
    pub fn builtin_lua() -> Self {
        Self::new([
            ("lua/ui.lua", include_bytes!("../../assets/lua/ui.lua").as_slice()),
            ("lua/timing.lua", include_bytes!("../../assets/lua/timing.lua").as_slice()),
        ])
    }

    fn get(&self, key: &str) -> Option<&[u8]> {
        self.files.get(key).map(|c| c.as_ref())
    }

    fn is_dir(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return !self.files.is_empty();
        }
        let dir_prefix = format!("{prefix}{PATH_SEPARATOR}");
        self.files
            .range(dir_prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&dir_prefix))
    }

    fn children(&self, prefix: &str) -> Vec<String> {
        let dir_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}{PATH_SEPARATOR}")
        };

        let names: BTreeSet<String> = self
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&dir_prefix))
            .filter_map(|rest| rest.split(PATH_SEPARATOR).next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        names.into_iter().collect()
    }
}

/// A view of an [`AssetBundle`] rooted at some directory inside it.
#[derive(Debug, Clone)]
pub struct AssetSource {
    bundle: AssetBundle,
    base: String,
}

impl AssetSource {
    /// Create a source for `base` inside `bundle`. Trailing separators are ignored.
    pub fn new(bundle: AssetBundle, base: &str) -> Self {
        Self {
            bundle,
            base: base.trim_end_matches(PATH_SEPARATOR).to_string(),
        }
    }

    fn key(&self, path: &VirtualPath) -> String {
        match (self.base.is_empty(), path.is_root()) {
            (_, true) => self.base.clone(),
            (true, false) => path.to_string(),
            (false, false) => format!("{}{}{}", self.base, PATH_SEPARATOR, path),
        }
    }

    pub(crate) fn paths(&self, path: &VirtualPath) -> Vec<String> {
        self.bundle.children(&self.key(path))
    }

    pub(crate) fn contains(&self, path: &VirtualPath) -> bool {
        let key = self.key(path);
        self.bundle.get(&key).is_some() || self.bundle.is_dir(&key)
    }

    pub(crate) fn read(&self, path: &VirtualPath) -> Option<Box<dyn Read + Send>> {
        let bytes = self.bundle.get(&self.key(path))?;
        Some(Box::new(Cursor::new(bytes.to_vec())))
    }

    pub(crate) fn subsource(&self, path: &VirtualPath) -> Option<AssetSource> {
        let key = self.key(path);
        if !self.bundle.is_dir(&key) {
            return None;
        }
        Some(AssetSource::new(self.bundle.clone(), &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> AssetBundle {
        AssetBundle::new([
            ("lua/ui.lua", b"return {}".as_slice()),
            ("lua/lib/deep.lua", b"return 1".as_slice()),
            ("images/logo.png", b"\x89PNG".as_slice()),
        ])
    }

    fn vp(path: &str) -> VirtualPath {
        VirtualPath::parse(path).unwrap()
    }

    #[test]
    fn test_read_relative_to_base() {
        let source = AssetSource::new(bundle(), "lua/");
        let mut content = String::new();
        source
            .read(&vp("ui.lua"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "return {}");
        assert!(source.read(&vp("logo.png")).is_none());
    }

    #[test]
    fn test_paths_and_contains() {
        let source = AssetSource::new(bundle(), "");
        assert_eq!(source.paths(&VirtualPath::root()), vec!["images", "lua"]);
        assert_eq!(source.paths(&vp("lua")), vec!["lib", "ui.lua"]);
        assert!(source.contains(&vp("lua/lib")));
        assert!(source.contains(&vp("images/logo.png")));
        assert!(!source.contains(&vp("lu")));
    }

    #[test]
    fn test_subsource_requires_directory() {
        let source = AssetSource::new(bundle(), "");
        let lib = source.subsource(&vp("lua/lib")).unwrap();
        assert!(lib.read(&vp("deep.lua")).is_some());
        assert!(source.subsource(&vp("lua/ui.lua")).is_none());
        assert!(source.subsource(&vp("missing")).is_none());
    }

    #[test]
    fn test_builtin_bundle_has_ui_module() {
        let source = AssetSource::new(AssetBundle::builtin_lua(), "lua");
        assert!(source.contains(&vp("ui.lua")));
        assert!(source.contains(&vp("timing.lua")));
    }
}
