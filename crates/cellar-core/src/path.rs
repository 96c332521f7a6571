use std::fmt;

use serde::{Deserialize, Serialize};

/// A normalized, forward-slash separated path relative to a backup root.
///
/// Construction strips leading separators and translates backslashes, so the
/// same source file names identically whatever platform produced it.
/// Traversal (`..`) is deliberately NOT rejected here; use sites that write
/// to disk call [`contains_traversal`] and refuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn new(path: &str) -> Self {
        let translated = path.replace('\\', "/");
        Self(translated.trim_start_matches('/').to_string())
    }

    /// Build a path from fragments, trimming separators off each fragment and
    /// joining with `/`. Empty fragments are dropped.
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = fragments
            .into_iter()
            .map(|f| f.as_ref().trim_matches(|c| c == '/' || c == '\\').to_string())
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self::new(&joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when any component of the path is `..`.
    pub fn is_traversal(&self) -> bool {
        contains_traversal(&self.0)
    }

    /// The final path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelativePath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// True when any `/`- or `\`-separated component of `text` is `..`.
///
/// Also applied to content hashes before they are used to build object paths,
/// as a defence against a corrupted or hostile manifest.
pub fn contains_traversal(text: &str) -> bool {
    text.split(['/', '\\']).any(|component| component == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_strips_leading_separators() {
        assert_eq!(RelativePath::new("/a/b.txt").as_str(), "a/b.txt");
        assert_eq!(RelativePath::new("\\a\\b.txt").as_str(), "a/b.txt");
        assert_eq!(RelativePath::new("a/b.txt").as_str(), "a/b.txt");
    }

    #[test]
    fn test_from_fragments() {
        let path = RelativePath::from_fragments(["a/", "/b", "c.txt"]);
        assert_eq!(path.as_str(), "a/b/c.txt");

        let path = RelativePath::from_fragments(["", "a", ""]);
        assert_eq!(path.as_str(), "a");
    }

    #[test]
    fn test_traversal_detection() {
        assert!(RelativePath::new("a/../b").is_traversal());
        assert!(RelativePath::new("../etc/passwd").is_traversal());
        assert!(!RelativePath::new("a/b..c/d").is_traversal());
        assert!(!RelativePath::new("a/b/c").is_traversal());
    }

    #[test]
    fn test_file_name() {
        assert_eq!(RelativePath::new("a/b/c.txt").file_name(), "c.txt");
        assert_eq!(RelativePath::new("c.txt").file_name(), "c.txt");
    }
}
