/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use log::debug;
use rustix::fs::{FileType, Mode, OFlags};
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, BranchConfig, Config};
use crate::errors::{Result, UnionFsError};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BranchMode {
    Ro,
    Rw,
}

/// One underlying directory of the union stack.
///
/// `root_handle` is present iff the handle backend is selected; it stays
/// open from stack initialization until the branch is dropped and is never
/// rotated.
#[derive(Debug)]
pub struct Branch {
    pub ordinal: usize,
    pub root_path: PathBuf,
    pub root_handle: Option<OwnedFd>,
    pub mode: BranchMode,
}

impl Branch {
    fn open(ordinal: usize, config: &BranchConfig, backend: BackendKind) -> Result<Branch> {
        let root_handle = match backend {
            BackendKind::Handle => {
                // O_DIRECTORY makes a non-directory root fail fast with
                // ENOTDIR instead of failing oddly on first use.
                let fd = rustix::fs::open(
                    &config.path,
                    OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
                    Mode::empty(),
                )
                .map_err(|errno| UnionFsError::syscall("open branch root", errno))?;
                Some(fd)
            }
            BackendKind::Prefix => {
                let stat = rustix::fs::stat(&config.path)
                    .map_err(|errno| UnionFsError::syscall("stat branch root", errno))?;
                if FileType::from_raw_mode(stat.st_mode) != FileType::Directory {
                    return Err(UnionFsError::syscall(
                        "stat branch root",
                        rustix::io::Errno::NOTDIR,
                    ));
                }
                None
            }
        };
        debug!(
            "opened branch {} at '{}' ({:?})",
            ordinal,
            config.path.display(),
            config.mode
        );
        Ok(Branch {
            ordinal,
            root_path: config.path.clone(),
            root_handle,
            mode: config.mode,
        })
    }

    pub fn is_writable(&self) -> bool {
        self.mode == BranchMode::Rw
    }
}

/// Open every configured branch root. Ordinals are dense by position in
/// the configured list.
pub fn open_stack(config: &Config) -> Result<Vec<Branch>> {
    config
        .branches
        .iter()
        .enumerate()
        .map(|(ordinal, branch)| Branch::open(ordinal, branch, config.backend))
        .collect()
}

/// Branch discovery across the stack, provided by the union layer above
/// this engine: the ordinal of the topmost branch where a user path
/// resolves, or `None` when it resolves nowhere.
pub trait BranchFinder {
    fn find_branch(&self, path: &str) -> Option<usize>;
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn stack_config(root: &std::path::Path, backend: BackendKind) -> Config {
        fs::create_dir_all(root.join("ro")).unwrap();
        fs::create_dir_all(root.join("rw")).unwrap();
        Config {
            cow_enabled: true,
            backend,
            metadata_dir: ".unionfs".to_owned(),
            hide_tag: "__HIDDEN__".to_owned(),
            branches: vec![
                BranchConfig {
                    path: root.join("ro"),
                    mode: BranchMode::Ro,
                },
                BranchConfig {
                    path: root.join("rw"),
                    mode: BranchMode::Rw,
                },
            ],
        }
    }

    #[test]
    fn open_stack_handle_backend_holds_fds() {
        let tmp = tempfile::tempdir().unwrap();
        let branches = open_stack(&stack_config(tmp.path(), BackendKind::Handle)).unwrap();
        assert_eq!(branches.len(), 2);
        assert!(branches[0].root_handle.is_some());
        assert_eq!(branches[0].ordinal, 0);
        assert!(!branches[0].is_writable());
        assert!(branches[1].is_writable());
    }

    #[test]
    fn open_stack_prefix_backend_holds_no_fds() {
        let tmp = tempfile::tempdir().unwrap();
        let branches = open_stack(&stack_config(tmp.path(), BackendKind::Prefix)).unwrap();
        assert!(branches[0].root_handle.is_none());
        assert!(branches[1].root_handle.is_none());
    }

    #[test]
    fn non_directory_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, b"x").unwrap();
        for backend in [BackendKind::Handle, BackendKind::Prefix] {
            let config = Config {
                branches: vec![BranchConfig {
                    path: file.clone(),
                    mode: BranchMode::Rw,
                }],
                ..stack_config(tmp.path(), backend)
            };
            let err = open_stack(&config).unwrap_err();
            assert_eq!(err.errno(), rustix::io::Errno::NOTDIR);
        }
    }
}
