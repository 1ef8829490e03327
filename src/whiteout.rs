/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use log::{debug, warn};
use rustix::fs::Mode;

use crate::branch::BranchFinder;
use crate::branchio::{BranchIo, PathKind};
use crate::config::Config;
use crate::cow::create_path_chain;
use crate::errors::{Result, UnionFsError};
use crate::path::prefixes;

/// Marker flavor; it must match the type of the object being hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutKind {
    File,
    Dir,
}

const WHITEOUT_FILE_MODE: u32 = 0o600;
const WHITEOUT_DIR_MODE: u32 = 0o700;

/// Hide markers: sentinels under a branch's reserved metadata directory
/// that make the union view treat an underlying path as absent.
///
/// A marker for `/a/b/c` lives at `<root>/<metadata_dir>/a/b/c/<hide_tag>`;
/// hiding a directory implicitly hides everything below it, so no marker
/// is ever planted at a descendant.
pub struct WhiteoutStore<'a> {
    io: &'a BranchIo,
    config: &'a Config,
    finder: &'a dyn BranchFinder,
}

impl<'a> WhiteoutStore<'a> {
    pub fn new(
        io: &'a BranchIo,
        config: &'a Config,
        finder: &'a dyn BranchFinder,
    ) -> WhiteoutStore<'a> {
        WhiteoutStore { io, config, finder }
    }

    /// True when `path` starts inside the reserved metadata namespace and
    /// must not be exposed in the union view.
    pub fn is_reserved(&self, path: &str) -> bool {
        let first = path.trim_start_matches('/');
        let first = first.split('/').next().unwrap_or("");
        first == self.config.metadata_dir
    }

    /// Record a file whiteout for `path` on `rw_branch`.
    pub fn hide_file(&self, path: &str, rw_branch: usize) -> Result<()> {
        self.hide(path, rw_branch, WhiteoutKind::File)
    }

    /// Record a directory whiteout for `path` on `rw_branch`.
    pub fn hide_dir(&self, path: &str, rw_branch: usize) -> Result<()> {
        self.hide(path, rw_branch, WhiteoutKind::Dir)
    }

    fn hide(&self, path: &str, rw_branch: usize, kind: WhiteoutKind) -> Result<()> {
        if !self.config.cow_enabled {
            return Ok(());
        }
        let branch = self.io.branch(rw_branch)?;
        if !branch.is_writable() {
            return Err(UnionFsError::ReadOnlyBranch(rw_branch));
        }
        debug!("hide '{}' on branch {} ({:?})", path, rw_branch, kind);

        // Mirror the hidden path inside the metadata tree, then drop the
        // tag at its tip. The chain is a plain mkdir walk on this same
        // branch.
        let shadow = self.shadow_path(path)?;
        create_path_chain(self.io, &shadow, rw_branch, rw_branch)?;

        match kind {
            WhiteoutKind::File => {
                let mode = Mode::from_bits_truncate(WHITEOUT_FILE_MODE);
                let marker = self
                    .io
                    .create(rw_branch, &[&shadow, "/", &self.config.hide_tag], mode)?;
                drop(marker);
                // Exact mode despite the process umask at creation.
                self.io
                    .chmod(rw_branch, &[&shadow, "/", &self.config.hide_tag], mode)
            }
            WhiteoutKind::Dir => {
                let mode = Mode::from_bits_truncate(WHITEOUT_DIR_MODE);
                self.io
                    .mkdir(rw_branch, &[&shadow, "/", &self.config.hide_tag], mode)?;
                self.io
                    .chmod(rw_branch, &[&shadow, "/", &self.config.hide_tag], mode)
            }
        }
    }

    /// Called after a successful unlink/rmdir on the writable branch:
    /// plant a whiteout iff the path still resolves somewhere in the
    /// stack, so the union view stops exposing it either way.
    ///
    /// The caller just removed the object and is the only party who knew
    /// its type, so the kind is taken as given.
    pub fn maybe_whiteout(&self, path: &str, rw_branch: usize, kind: WhiteoutKind) -> Result<()> {
        if !self.config.cow_enabled {
            return Ok(());
        }
        if self.finder.find_branch(path).is_none() {
            return Ok(());
        }
        self.hide(path, rw_branch, kind)
            .map_err(|err| UnionFsError::Whiteout(Box::new(err)))
    }

    /// Is `path` itself shadowed by a marker on `branch`?
    pub fn is_hidden(&self, path: &str, branch: usize) -> Result<bool> {
        if !self.config.cow_enabled {
            return Ok(false);
        }
        let shadow = self.shadow_path(path)?;
        self.io
            .exists(branch, &[&shadow, "/", &self.config.hide_tag])
    }

    /// Is any prefix of `path` (the path itself included) shadowed on
    /// `branch`? Hiding a directory hides everything below it without
    /// per-descendant markers.
    pub fn path_hidden(&self, path: &str, branch: usize) -> Result<bool> {
        if !self.config.cow_enabled {
            return Ok(false);
        }
        for prefix in prefixes(path) {
            if self.is_hidden(prefix, branch)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Garbage-collect markers for `path` on branches `0..=max_branch`
    /// (the whole stack when `None`). Best effort: failures are logged
    /// and the sweep continues.
    pub fn remove_hidden(&self, path: &str, max_branch: Option<usize>) {
        if !self.config.cow_enabled || self.io.nbranches() == 0 {
            return;
        }
        let last = max_branch
            .unwrap_or(self.io.nbranches() - 1)
            .min(self.io.nbranches() - 1);

        for ordinal in 0..=last {
            let shadow = match self.shadow_path(path) {
                Ok(shadow) => shadow,
                Err(err) => {
                    warn!("cannot compose whiteout path for '{}': {}", path, err);
                    return;
                }
            };
            let marker: &[&str] = &[&shadow, "/", &self.config.hide_tag];
            // The probe decides between unlink and rmdir.
            let removal = match self.io.path_is_dir(ordinal, marker) {
                Ok(PathKind::NotExisting) => continue,
                Ok(PathKind::IsFile) => self.io.unlink(ordinal, marker),
                Ok(PathKind::IsDir) => self.io.rmdir(ordinal, marker),
                Err(err) => Err(err),
            };
            if let Err(err) = removal {
                warn!(
                    "cannot remove whiteout for '{}' on branch {}: {}",
                    path, ordinal, err
                );
            }
        }
    }

    /// The metadata-tree mirror of a user path: `/a/b` ->
    /// `/<metadata_dir>/a/b`.
    fn shadow_path(&self, path: &str) -> Result<String> {
        Ok(
            crate::path::BranchPath::compose(&["/", &self.config.metadata_dir, path])?
                .as_str()
                .to_owned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    use super::*;
    use crate::branchio::tests::{FixedFinder, TestStack, BACKENDS};

    /// Stand-in finders: the path resolves nowhere, or on the bottom
    /// branch.
    const NOWHERE: FixedFinder = FixedFinder(None);
    const LOWER: FixedFinder = FixedFinder(Some(0));

    #[test]
    fn hide_file_plants_marker_and_hides_path() -> anyhow::Result<()> {
        for backend in BACKENDS {
            let stack = TestStack::new(backend);
            let io = stack.io();
            let store = WhiteoutStore::new(&io, &stack.config, &NOWHERE);

            store.hide_file("/tmp", 1)?;

            let marker = stack.rw().join(".unionfs/tmp/__HIDDEN__");
            let meta = fs::metadata(&marker)?;
            assert!(meta.is_file());
            assert_eq!(meta.len(), 0);
            assert_eq!(meta.mode() & 0o7777, 0o600);

            assert!(store.is_hidden("/tmp", 1)?);
            assert!(store.path_hidden("/tmp", 1)?);
            assert!(!store.path_hidden("/other", 1)?);
        }
        Ok(())
    }

    #[test]
    fn hiding_a_directory_hides_descendants() -> anyhow::Result<()> {
        for backend in BACKENDS {
            let stack = TestStack::new(backend);
            let io = stack.io();
            let store = WhiteoutStore::new(&io, &stack.config, &NOWHERE);

            store.hide_dir("/logs", 1)?;

            let marker = stack.rw().join(".unionfs/logs/__HIDDEN__");
            let meta = fs::metadata(&marker)?;
            assert!(meta.is_dir());
            assert_eq!(meta.mode() & 0o7777, 0o700);

            assert!(store.path_hidden("/logs/2024/jan.txt", 1)?);
            assert!(!store.is_hidden("/logs/2024/jan.txt", 1)?);
        }
        Ok(())
    }

    #[test]
    fn metadata_chain_directories_get_group_mode() -> anyhow::Result<()> {
        let stack = TestStack::new(crate::config::BackendKind::Handle);
        let io = stack.io();
        let store = WhiteoutStore::new(&io, &stack.config, &NOWHERE);

        store.hide_file("/a/b/c", 1)?;
        for sub in [".unionfs", ".unionfs/a", ".unionfs/a/b", ".unionfs/a/b/c"] {
            let meta = fs::metadata(stack.rw().join(sub))?;
            assert_eq!(meta.mode() & 0o7777, 0o770);
        }
        Ok(())
    }

    #[test]
    fn maybe_whiteout_consults_the_finder() -> anyhow::Result<()> {
        for backend in BACKENDS {
            let stack = TestStack::new(backend);
            let io = stack.io();
            // Path no longer resolves anywhere: nothing to hide.
            let store = WhiteoutStore::new(&io, &stack.config, &NOWHERE);
            store.maybe_whiteout("/tmp", 1, WhiteoutKind::File)?;
            assert!(!store.path_hidden("/tmp", 1)?);

            // Still visible on a lower branch: the marker appears.
            let store = WhiteoutStore::new(&io, &stack.config, &LOWER);
            store.maybe_whiteout("/tmp", 1, WhiteoutKind::File)?;
            assert!(stack.rw().join(".unionfs/tmp/__HIDDEN__").is_file());
            assert!(store.path_hidden("/tmp", 1)?);
        }
        Ok(())
    }

    #[test]
    fn remove_hidden_sweeps_both_flavors() -> anyhow::Result<()> {
        for backend in BACKENDS {
            let stack = TestStack::new(backend);
            let io = stack.io();
            let store = WhiteoutStore::new(&io, &stack.config, &NOWHERE);

            store.hide_file("/f", 1)?;
            store.hide_dir("/d", 1)?;

            store.remove_hidden("/f", None);
            store.remove_hidden("/d", Some(1));
            // Absent markers are fine to sweep again.
            store.remove_hidden("/f", None);

            assert!(!store.is_hidden("/f", 1)?);
            assert!(!store.is_hidden("/d", 1)?);
            assert!(!stack.rw().join(".unionfs/f/__HIDDEN__").exists());
            assert!(!stack.rw().join(".unionfs/d/__HIDDEN__").exists());
        }
        Ok(())
    }

    #[test]
    fn disabled_cow_short_circuits_without_io() -> anyhow::Result<()> {
        let mut stack = TestStack::new(crate::config::BackendKind::Handle);
        stack.config.cow_enabled = false;
        let io = stack.io();
        let store = WhiteoutStore::new(&io, &stack.config, &LOWER);

        store.hide_file("/tmp", 1)?;
        store.hide_dir("/logs", 1)?;
        store.maybe_whiteout("/tmp", 1, WhiteoutKind::File)?;
        store.remove_hidden("/tmp", None);

        assert!(!store.is_hidden("/tmp", 1)?);
        assert!(!store.path_hidden("/logs/deep", 1)?);
        // No metadata tree was ever created.
        assert!(!stack.rw().join(".unionfs").exists());
        Ok(())
    }

    #[test]
    fn hide_on_read_only_branch_is_refused() {
        let stack = TestStack::new(crate::config::BackendKind::Handle);
        let io = stack.io();
        let store = WhiteoutStore::new(&io, &stack.config, &NOWHERE);

        let err = store.hide_file("/tmp", 0).unwrap_err();
        assert_eq!(err.errno(), rustix::io::Errno::ROFS);
    }

    #[test]
    fn reserved_namespace_is_detected() {
        let stack = TestStack::new(crate::config::BackendKind::Handle);
        let io = stack.io();
        let store = WhiteoutStore::new(&io, &stack.config, &NOWHERE);

        assert!(store.is_reserved("/.unionfs"));
        assert!(store.is_reserved("/.unionfs/a/b"));
        assert!(!store.is_reserved("/data/.unionfs"));
        assert!(!store.is_reserved("/"));
    }

    #[test]
    fn whiteout_failure_keeps_its_errno() {
        let stack = TestStack::new(crate::config::BackendKind::Handle);
        let io = stack.io();
        let store = WhiteoutStore::new(&io, &stack.config, &LOWER);

        // Occupy the marker's parent with a regular file so the chain
        // cannot be built.
        fs::create_dir(stack.rw().join(".unionfs")).unwrap();
        fs::set_permissions(
            stack.rw().join(".unionfs"),
            fs::Permissions::from_mode(0o770),
        )
        .unwrap();
        fs::write(stack.rw().join(".unionfs/tmp"), b"").unwrap();

        let err = store
            .maybe_whiteout("/tmp/x", 1, WhiteoutKind::File)
            .unwrap_err();
        assert!(matches!(err, UnionFsError::Whiteout(_)));
        assert_eq!(err.errno(), rustix::io::Errno::NOTDIR);
    }
}
