//! Virtual path resolution.
//!
//! Paths handed to a [`DataSource`](super::DataSource) are slash-separated and
//! relative to the source root. `\` escapes a literal `/` or `\` inside a
//! segment. Resolution is purely lexical: `.` and empty segments vanish, `..`
//! pops the previous segment, and a `..` with nothing left to pop is a
//! [`PathEscape`] rather than being clamped to the root.

use std::fmt;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '/';

/// Escape character for literal separators inside a segment.
pub const ESCAPE_CHAR: char = '\\';

/// A path tried to climb above the root of its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEscape;

impl fmt::Display for PathEscape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("path escapes its root")
    }
}

impl std::error::Error for PathEscape {}

fn is_escapable(c: char) -> bool {
    c == PATH_SEPARATOR || c == ESCAPE_CHAR
}

/// Split a path on unescaped separators.
///
/// Escape sequences are kept verbatim in the resulting segments. A trailing
/// escape character with nothing after it is kept as a literal character of
/// the last segment.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut escaping = false;

    for c in path.chars() {
        if escaping {
            current.push(c);
            escaping = false;
        } else if c == ESCAPE_CHAR {
            current.push(c);
            escaping = true;
        } else if c == PATH_SEPARATOR {
            segments.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }

    segments.push(current);
    segments
}

/// Escape a caller-supplied string so it forms exactly one path segment.
///
/// `.` becomes `_` so identifiers can never be read as `.` or `..`.
pub fn escape_segment(segment: &str) -> String {
    escape_name(&segment.replace('.', "_"))
}

/// Escape an entry name, as listed by [`DataSource::paths`], so it can be
/// joined into a path.
///
/// Unlike [`escape_segment`] the name is kept otherwise unchanged.
///
/// [`DataSource::paths`]: super::DataSource::paths
pub fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());

    for c in name.chars() {
        if is_escapable(c) {
            escaped.push(ESCAPE_CHAR);
        }
        escaped.push(c);
    }

    escaped
}

/// Remove escape characters from a single segment.
pub fn unescape_segment(segment: &str) -> String {
    let mut literal = String::with_capacity(segment.len());
    let mut chars = segment.chars();

    while let Some(c) = chars.next() {
        if c == ESCAPE_CHAR {
            match chars.next() {
                Some(next) => literal.push(next),
                None => literal.push(c),
            }
        } else {
            literal.push(c);
        }
    }

    literal
}

/// A normalized path relative to some root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VirtualPath {
    segments: Vec<String>,
}

impl VirtualPath {
    /// The root of a source.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse and normalize a relative path.
    pub fn parse(path: &str) -> Result<Self, PathEscape> {
        let mut segments: Vec<String> = Vec::new();

        for segment in split_path(path) {
            match segment.as_str() {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathEscape);
                    }
                }
                _ => segments.push(segment),
            }
        }

        Ok(Self { segments })
    }

    /// Normalized segments, still escaped.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Whether this path refers to the root itself.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, unless this is the root.
    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Resolve `other` relative to this path.
    pub fn join(&self, other: &str) -> Result<Self, PathEscape> {
        let mut joined = self.to_string();
        joined.push(PATH_SEPARATOR);
        joined.push_str(other);
        Self::parse(&joined)
    }

    /// The normalized path, or `None` for the root.
    pub fn to_relative(&self) -> Option<String> {
        if self.is_root() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{PATH_SEPARATOR}")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

/// Normalize a relative path.
///
/// Returns `None` both when the path names the root itself and when it would
/// escape the root.
pub fn resolve_path(path: &str) -> Option<String> {
    VirtualPath::parse(path).ok().and_then(|p| p.to_relative())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain() {
        assert_eq!(split_path("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_path(""), vec![""]);
        assert_eq!(split_path("/a/"), vec!["", "a", ""]);
    }

    #[test]
    fn test_split_respects_escapes() {
        assert_eq!(split_path(r"a\/b/c"), vec![r"a\/b", "c"]);
        // an escaped escape does not protect the following separator
        assert_eq!(split_path(r"a\\/b"), vec![r"a\\", "b"]);
    }

    #[test]
    fn test_split_trailing_escape_is_literal() {
        assert_eq!(split_path(r"a/b\"), vec!["a", r"b\"]);
        assert_eq!(unescape_segment(r"b\"), r"b\");
    }

    #[test]
    fn test_resolve_normalizes() {
        assert_eq!(resolve_path("a/./b//c"), Some("a/b/c".to_string()));
        assert_eq!(resolve_path("a/b/../c"), Some("a/c".to_string()));
        assert_eq!(resolve_path("./a/"), Some("a".to_string()));
    }

    #[test]
    fn test_resolve_root_is_none() {
        assert_eq!(resolve_path("."), None);
        assert_eq!(resolve_path(""), None);
        assert_eq!(resolve_path("a/.."), None);
        assert!(VirtualPath::parse("a/..").unwrap().is_root());
    }

    #[test]
    fn test_resolve_escape_is_error() {
        assert_eq!(VirtualPath::parse(".."), Err(PathEscape));
        assert_eq!(VirtualPath::parse("a/../.."), Err(PathEscape));
        assert_eq!(VirtualPath::parse("../../etc/passwd"), Err(PathEscape));
        assert_eq!(resolve_path("a/../../b"), None);
    }

    #[test]
    fn test_resolve_never_leads_with_parent() {
        let samples = [
            "a/b/../../c",
            "x/../y/./z/..",
            "./././q",
            "m/n/o/../../..",
            "a/../b/../c/../d",
        ];
        for sample in samples {
            if let Some(resolved) = resolve_path(sample) {
                assert!(!resolved.starts_with(".."), "{sample} -> {resolved}");
                assert!(split_path(&resolved).iter().all(|s| s != ".." && s != "."));
            }
        }
    }

    #[test]
    fn test_escape_segment_maps_dots() {
        assert_eq!(escape_segment("game.v1"), "game_v1");
        assert_eq!(escape_segment(".."), "__");
        assert_eq!(escape_segment(r"a/b\c"), r"a\/b\\c");
    }

    #[test]
    fn test_escape_round_trips_as_single_segment() {
        for raw in ["plain", "with.dot", "sl/ash", r"back\slash", "../../etc", r"mix/.\x"] {
            let escaped = escape_segment(raw);
            let path = VirtualPath::parse(&escaped).unwrap();
            assert_eq!(path.segments().len(), 1, "{raw}");
            assert_eq!(unescape_segment(&path.segments()[0]), raw.replace('.', "_"));
        }
    }

    #[test]
    fn test_escape_name_keeps_dots() {
        assert_eq!(escape_name(r"a.b\c/d"), r"a.b\\c\/d");
        let path = VirtualPath::parse(&format!("{}/x", escape_name(r"a\b"))).unwrap();
        assert_eq!(path.segments().len(), 2);
        assert_eq!(unescape_segment(&path.segments()[0]), r"a\b");
    }

    #[test]
    fn test_join() {
        let base = VirtualPath::parse("games/chess").unwrap();
        assert_eq!(base.join("../go").unwrap().to_string(), "games/go");
        assert_eq!(base.join("../../..").unwrap_err(), PathEscape);
        assert_eq!(base.file_name(), Some("chess"));
    }
}
