// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Hierarchical storage paths.

use crate::FileError;

/// A slash-delimited absolute storage path of ASCII-identifier components.
///
/// `/revision/12/change` — components match `[A-Za-z0-9_-]+`. Paths are
/// hierarchical keys: `/a/b` is a child of `/a`. Ordering is lexicographic
/// over the canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoragePath(String);

impl StoragePath {
    /// Parses and validates a path string.
    ///
    /// # Errors
    ///
    /// `BadPath` unless the string is absolute, non-root, and every
    /// component is a non-empty ASCII identifier.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, FileError> {
        let raw = raw.as_ref();
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(FileError::BadPath(format!(
                "storage path must be absolute: {raw:?}"
            )));
        };
        if rest.is_empty() {
            return Err(FileError::BadPath("storage path must be non-root".into()));
        }
        for component in rest.split('/') {
            if !Self::valid_component(component) {
                return Err(FileError::BadPath(format!(
                    "invalid path component {component:?} in {raw:?}"
                )));
            }
        }
        Ok(Self(raw.to_owned()))
    }

    fn valid_component(component: &str) -> bool {
        !component.is_empty()
            && component
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    /// The canonical string form, starting with `/`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends one component.
    ///
    /// # Errors
    ///
    /// `BadPath` when `component` is not a valid identifier.
    pub fn join(&self, component: impl AsRef<str>) -> Result<Self, FileError> {
        let component = component.as_ref();
        if !Self::valid_component(component) {
            return Err(FileError::BadPath(format!(
                "invalid path component {component:?}"
            )));
        }
        Ok(Self(format!("{}/{component}", self.0)))
    }

    /// Appends a numeric component.
    pub fn join_index(&self, index: u64) -> Self {
        Self(format!("{}/{index}", self.0))
    }

    /// The path components, in order.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// `true` when `other` is strictly below this path.
    pub fn is_strict_prefix_of(&self, other: &Self) -> bool {
        other
            .0
            .strip_prefix(&self.0)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// The first component of `other` below this path, if any.
    pub fn child_component_of<'a>(&self, other: &'a Self) -> Option<&'a str> {
        let rest = other.0.strip_prefix(&self.0)?.strip_prefix('/')?;
        Some(rest.split('/').next().unwrap_or(rest))
    }

    /// Joins a component already known to be valid (it came from a stored
    /// path).
    pub(crate) fn join_known(&self, component: &str) -> Self {
        Self(format!("{}/{component}", self.0))
    }
}

impl core::fmt::Display for StoragePath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── 1. validation ───────────────────────────────────────────────────

    #[test]
    fn accepts_identifier_paths() {
        for ok in ["/revision_number", "/revision/37/change", "/caret/s-1_a"] {
            assert!(StoragePath::new(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", "/", "relative", "//x", "/a//b", "/a/", "/sp ace", "/uni\u{e9}"] {
            assert!(StoragePath::new(bad).is_err(), "{bad:?}");
        }
    }

    // ── 2. hierarchy helpers ────────────────────────────────────────────

    #[test]
    fn join_and_prefix() {
        let root = StoragePath::new("/revision").unwrap();
        let child = root.join_index(5).join("change").unwrap();
        assert_eq!(child.as_str(), "/revision/5/change");
        assert!(root.is_strict_prefix_of(&child));
        assert!(!root.is_strict_prefix_of(&root));
        // Sibling names that share a string prefix are not hierarchy prefixes.
        let sibling = StoragePath::new("/revision_number").unwrap();
        assert!(!root.is_strict_prefix_of(&sibling));
    }

    #[test]
    fn child_component_extraction() {
        let root = StoragePath::new("/revision").unwrap();
        let deep = StoragePath::new("/revision/12/change").unwrap();
        assert_eq!(root.child_component_of(&deep), Some("12"));
        let direct = StoragePath::new("/revision/3").unwrap();
        assert_eq!(root.child_component_of(&direct), Some("3"));
        let outside = StoragePath::new("/caret/s1").unwrap();
        assert_eq!(root.child_component_of(&outside), None);
    }
}
