/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::ffi::OsString;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::errors::{Result, UnionFsError};

/// Upper bound on every constructed branch-local path, terminator included.
pub const PATHLEN_MAX: usize = 4096;

/// A branch-local path, composed from caller-supplied fragments and bounded
/// by [`PATHLEN_MAX`].
///
/// Fragments are concatenated verbatim: callers supply literal `/` where
/// they want one. User paths enter with a leading `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPath(String);

impl Display for BranchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BranchPath {
    pub fn compose(parts: &[&str]) -> Result<Self> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len + 1 > PATHLEN_MAX {
            return Err(UnionFsError::PathTooLong);
        }
        Ok(BranchPath(parts.concat()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative form for the `*at` family: leading slashes stripped, empty
    /// remainder becomes `.`.
    pub fn relative(&self) -> &str {
        let rel = self.0.trim_start_matches('/');
        if rel.is_empty() {
            "."
        } else {
            rel
        }
    }

    /// Absolute form for the prefix backend. The bound applies to prefix
    /// plus path plus terminator.
    pub fn under(&self, root: &Path) -> Result<PathBuf> {
        let root_len = root.as_os_str().len();
        if root_len + self.0.len() + 1 > PATHLEN_MAX {
            return Err(UnionFsError::PathTooLong);
        }
        let mut joined = OsString::from(root);
        joined.push(&self.0);
        Ok(PathBuf::from(joined))
    }
}

/// Parent directory of a user path: `/a/b/c` -> `/a/b`, `/a` -> `/`.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Walk every prefix of `path` under path-component decomposition:
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`. Repeated separators collapse;
/// the root itself is never yielded.
pub fn prefixes(path: &str) -> Prefixes<'_> {
    Prefixes { path, pos: 0 }
}

pub struct Prefixes<'a> {
    path: &'a str,
    pos: usize,
}

impl<'a> Iterator for Prefixes<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let bytes = self.path.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos] == b'/' {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return None;
        }
        while self.pos < bytes.len() && bytes[self.pos] != b'/' {
            self.pos += 1;
        }
        Some(&self.path[..self.pos])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_concatenates_verbatim() {
        let p = BranchPath::compose(&["/docs", "/", "readme.txt"]).unwrap();
        assert_eq!(p.as_str(), "/docs/readme.txt");
    }

    #[test]
    fn compose_length_boundary() {
        let long = "a".repeat(PATHLEN_MAX - 2);
        let fits = BranchPath::compose(&["/", &long]).unwrap();
        assert_eq!(fits.as_str().len(), PATHLEN_MAX - 1);

        let over = "a".repeat(PATHLEN_MAX - 1);
        assert!(matches!(
            BranchPath::compose(&["/", &over]),
            Err(UnionFsError::PathTooLong)
        ));
    }

    #[test]
    fn relative_strips_leading_slash() {
        assert_eq!(BranchPath::compose(&["/a/b"]).unwrap().relative(), "a/b");
        assert_eq!(BranchPath::compose(&["/"]).unwrap().relative(), ".");
        assert_eq!(BranchPath::compose(&[""]).unwrap().relative(), ".");
    }

    #[test]
    fn under_checks_prefix_length() {
        let p = BranchPath::compose(&["/x"]).unwrap();
        assert_eq!(
            p.under(Path::new("/root")).unwrap(),
            PathBuf::from("/root/x")
        );

        let root = "/".to_owned() + &"r".repeat(PATHLEN_MAX - 3);
        assert!(matches!(
            p.under(Path::new(&root)),
            Err(UnionFsError::PathTooLong)
        ));
    }

    #[test]
    fn dirname_walks_up() {
        assert_eq!(dirname("/a/b/c"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/"), "/");
    }

    #[test]
    fn prefixes_yield_every_component_boundary() {
        let all: Vec<&str> = prefixes("/a/bb/c").collect();
        assert_eq!(all, vec!["/a", "/a/bb", "/a/bb/c"]);
    }

    #[test]
    fn prefixes_collapse_repeated_separators() {
        let all: Vec<&str> = prefixes("//a//b").collect();
        assert_eq!(all, vec!["//a", "//a//b"]);
        assert!(prefixes("/").next().is_none());
    }
}
