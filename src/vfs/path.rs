//! VFS path handling.
//!
//! Entries are keyed by their full path. Directories carry a trailing `/`,
//! regular files do not, and the root is the single key `/`.

use crate::error::{Error, Result};
use std::fmt;

/// A validated, normalized VFS path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VfsPath {
    components: Vec<String>,
}

impl VfsPath {
    /// Parse a path string.
    ///
    /// Paths must be absolute (start with /). Repeated and trailing slashes
    /// are dropped.
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(Error::InvalidPath(
                "Path must be absolute (start with /)".to_string(),
            ));
        }

        let components: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        for component in &components {
            if component == "." || component == ".." || component.contains('\0') {
                return Err(Error::InvalidPath(format!(
                    "Invalid path component: {}",
                    component
                )));
            }
        }

        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            Some(Self {
                components: self.components[..self.components.len() - 1].to_vec(),
            })
        }
    }

    /// Whether `self` equals `other` or lies below it.
    pub fn is_within(&self, other: &VfsPath) -> bool {
        self.components.starts_with(&other.components)
    }

    /// Key without a trailing slash, used for lookups.
    pub fn lookup_key(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }

    /// Key under which a directory entry is stored.
    pub fn dir_key(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}/", self.components.join("/"))
        }
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lookup_key())
    }
}

/// Strip the directory marker from a stored key.
pub(crate) fn lookup_form(key: &str) -> &str {
    if key.len() > 1 {
        key.strip_suffix('/').unwrap_or(key)
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_root() {
        let path = VfsPath::parse("/").unwrap();
        assert!(path.is_root());
        assert_eq!(path.lookup_key(), "/");
        assert_eq!(path.dir_key(), "/");
    }

    #[test]
    fn test_parse_simple() {
        let path = VfsPath::parse("/foo//bar").unwrap();
        assert_eq!(path.lookup_key(), "/foo/bar");
        assert_eq!(path.dir_key(), "/foo/bar/");
    }

    #[test]
    fn test_parse_trailing_slash() {
        let path = VfsPath::parse("/foo/bar/").unwrap();
        assert_eq!(path.to_string(), "/foo/bar");
    }

    #[test]
    fn test_parse_rejects() {
        assert!(VfsPath::parse("foo/bar").is_err());
        assert!(VfsPath::parse("/foo/../bar").is_err());
        assert!(VfsPath::parse("/a\0b").is_err());
    }

    #[test]
    fn test_parent() {
        let path = VfsPath::parse("/foo/bar/baz").unwrap();
        assert_eq!(path.parent().unwrap().to_string(), "/foo/bar");
        assert!(VfsPath::parse("/").unwrap().parent().is_none());
    }

    #[test]
    fn test_is_within() {
        let dir = VfsPath::parse("/a").unwrap();
        assert!(VfsPath::parse("/a/b").unwrap().is_within(&dir));
        assert!(dir.is_within(&dir));
        assert!(!VfsPath::parse("/ab").unwrap().is_within(&dir));
    }

    #[test]
    fn test_lookup_form() {
        assert_eq!(lookup_form("/"), "/");
        assert_eq!(lookup_form("/a/"), "/a");
        assert_eq!(lookup_form("/a"), "/a");
    }
}
