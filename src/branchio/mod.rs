/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

mod handle;
mod prefix;

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::os::fd::OwnedFd;

use rustix::fs::{FileType, Mode, OFlags, Stat, StatFs, Timespec, Timestamps, XattrFlags};
use rustix::io::Errno;

use crate::branch::Branch;
use crate::config::{BackendKind, Config};
use crate::errors::{Result, UnionFsError};
use crate::path::BranchPath;

use handle::HandleBackend;
use prefix::PrefixBackend;

/// What a branch-local path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    NotExisting,
    IsFile,
    IsDir,
}

/// The capability set both backends implement. One method per directory-entry
/// syscall; paths arrive already composed and bounded.
pub(crate) trait Backend: Send + Sync {
    fn stat(&self, branch: &Branch, path: &BranchPath) -> Result<Stat>;
    fn lstat(&self, branch: &Branch, path: &BranchPath) -> Result<Stat>;
    fn open(&self, branch: &Branch, path: &BranchPath, flags: OFlags, mode: Mode)
        -> Result<OwnedFd>;
    fn read_dir(&self, branch: &Branch, path: &BranchPath) -> Result<Vec<OsString>>;
    fn mkdir(&self, branch: &Branch, path: &BranchPath, mode: Mode) -> Result<()>;
    fn rmdir(&self, branch: &Branch, path: &BranchPath) -> Result<()>;
    fn unlink(&self, branch: &Branch, path: &BranchPath) -> Result<()>;
    fn link(
        &self,
        old_branch: &Branch,
        old_path: &BranchPath,
        new_branch: &Branch,
        new_path: &BranchPath,
    ) -> Result<()>;
    fn symlink(&self, target: &OsStr, branch: &Branch, path: &BranchPath) -> Result<()>;
    fn readlink(&self, branch: &Branch, path: &BranchPath) -> Result<OsString>;
    fn chmod(&self, branch: &Branch, path: &BranchPath, mode: Mode) -> Result<()>;
    fn chown(
        &self,
        branch: &Branch,
        path: &BranchPath,
        uid: u32,
        gid: u32,
        follow: bool,
    ) -> Result<()>;
    fn mknod(
        &self,
        branch: &Branch,
        path: &BranchPath,
        kind: FileType,
        mode: Mode,
        dev: u64,
    ) -> Result<()>;
    fn rename(&self, branch: &Branch, old_path: &BranchPath, new_path: &BranchPath) -> Result<()>;
    fn truncate(&self, branch: &Branch, path: &BranchPath, length: u64) -> Result<()>;
    fn utimens(&self, branch: &Branch, path: &BranchPath, times: &Timestamps) -> Result<()>;
    fn statfs(&self, branch: &Branch, path: &BranchPath) -> Result<StatFs>;
}

/// Branch-relative filesystem access.
///
/// Every operation takes a branch ordinal plus a slice of path fragments
/// that are concatenated verbatim into the branch-local path (callers
/// supply literal `/` where wanted). The backend is chosen once, at
/// construction, for the whole process.
pub struct BranchIo {
    branches: Vec<Branch>,
    backend: Box<dyn Backend>,
}

impl BranchIo {
    pub fn new(config: &Config) -> Result<BranchIo> {
        let branches = crate::branch::open_stack(config)?;
        Ok(Self::with_branches(branches, config.backend))
    }

    pub(crate) fn with_branches(branches: Vec<Branch>, backend: BackendKind) -> BranchIo {
        let backend: Box<dyn Backend> = match backend {
            BackendKind::Handle => Box::new(HandleBackend),
            BackendKind::Prefix => Box::new(PrefixBackend),
        };
        BranchIo { branches, backend }
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn nbranches(&self) -> usize {
        self.branches.len()
    }

    pub fn branch(&self, ordinal: usize) -> Result<&Branch> {
        self.branches
            .get(ordinal)
            .ok_or(UnionFsError::NoSuchBranch(ordinal))
    }

    fn target(&self, ordinal: usize, parts: &[&str]) -> Result<(&Branch, BranchPath)> {
        Ok((self.branch(ordinal)?, BranchPath::compose(parts)?))
    }

    pub fn stat(&self, branch: usize, parts: &[&str]) -> Result<Stat> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.stat(branch, &path)
    }

    pub fn lstat(&self, branch: usize, parts: &[&str]) -> Result<Stat> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.lstat(branch, &path)
    }

    pub fn open(&self, branch: usize, parts: &[&str], flags: OFlags, mode: Mode) -> Result<File> {
        let (branch, path) = self.target(branch, parts)?;
        let fd = self.backend.open(branch, &path, flags, mode)?;
        Ok(File::from(fd))
    }

    /// `creat` semantics: create or truncate, write-only.
    pub fn create(&self, branch: usize, parts: &[&str], mode: Mode) -> Result<File> {
        self.open(
            branch,
            parts,
            OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC,
            mode,
        )
    }

    /// Directory-entry names in kernel order, `.` and `..` included.
    pub fn opendir(&self, branch: usize, parts: &[&str]) -> Result<Vec<OsString>> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.read_dir(branch, &path)
    }

    pub fn mkdir(&self, branch: usize, parts: &[&str], mode: Mode) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.mkdir(branch, &path, mode)
    }

    pub fn rmdir(&self, branch: usize, parts: &[&str]) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.rmdir(branch, &path)
    }

    pub fn unlink(&self, branch: usize, parts: &[&str]) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.unlink(branch, &path)
    }

    /// Hard link across branch-local paths. When the branches differ the
    /// kernel's verdict on cross-mount linking is surfaced unchanged.
    pub fn link(
        &self,
        old_branch: usize,
        old_parts: &[&str],
        new_branch: usize,
        new_parts: &[&str],
    ) -> Result<()> {
        let (ob, op) = self.target(old_branch, old_parts)?;
        let (nb, np) = self.target(new_branch, new_parts)?;
        self.backend.link(ob, &op, nb, &np)
    }

    pub fn symlink(&self, target: &OsStr, branch: usize, parts: &[&str]) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.symlink(target, branch, &path)
    }

    pub fn readlink(&self, branch: usize, parts: &[&str]) -> Result<OsString> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.readlink(branch, &path)
    }

    pub fn chmod(&self, branch: usize, parts: &[&str], mode: Mode) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.chmod(branch, &path, mode)
    }

    pub fn chown(&self, branch: usize, parts: &[&str], uid: u32, gid: u32) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.chown(branch, &path, uid, gid, true)
    }

    pub fn lchown(&self, branch: usize, parts: &[&str], uid: u32, gid: u32) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.chown(branch, &path, uid, gid, false)
    }

    /// Ownership hook for freshly created objects: the acting context's
    /// ids, applied without following a trailing symlink.
    pub fn set_owner(&self, branch: usize, parts: &[&str], uid: u32, gid: u32) -> Result<()> {
        self.lchown(branch, parts, uid, gid)
    }

    pub fn mknod(
        &self,
        branch: usize,
        parts: &[&str],
        kind: FileType,
        mode: Mode,
        dev: u64,
    ) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.mknod(branch, &path, kind, mode, dev)
    }

    pub fn mkfifo(&self, branch: usize, parts: &[&str], mode: Mode) -> Result<()> {
        self.mknod(branch, parts, FileType::Fifo, mode, 0)
    }

    pub fn rename(&self, branch: usize, old_parts: &[&str], new_parts: &[&str]) -> Result<()> {
        let (branch, old_path) = self.target(branch, old_parts)?;
        let new_path = BranchPath::compose(new_parts)?;
        self.backend.rename(branch, &old_path, &new_path)
    }

    pub fn truncate(&self, branch: usize, parts: &[&str], length: u64) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.truncate(branch, &path, length)
    }

    /// Set both timestamps, seconds resolution, without following a
    /// trailing symlink.
    pub fn utimens(
        &self,
        branch: usize,
        parts: &[&str],
        atime_sec: i64,
        mtime_sec: i64,
    ) -> Result<()> {
        let (branch, path) = self.target(branch, parts)?;
        let times = Timestamps {
            last_access: Timespec {
                tv_sec: atime_sec,
                tv_nsec: 0,
            },
            last_modification: Timespec {
                tv_sec: mtime_sec,
                tv_nsec: 0,
            },
        };
        self.backend.utimens(branch, &path, &times)
    }

    pub fn statfs(&self, branch: usize, parts: &[&str]) -> Result<StatFs> {
        let (branch, path) = self.target(branch, parts)?;
        self.backend.statfs(branch, &path)
    }

    pub fn path_is_dir(&self, branch: usize, parts: &[&str]) -> Result<PathKind> {
        match self.lstat(branch, parts) {
            Ok(stat) => {
                if FileType::from_raw_mode(stat.st_mode) == FileType::Directory {
                    Ok(PathKind::IsDir)
                } else {
                    Ok(PathKind::IsFile)
                }
            }
            Err(err) if probe_missed(&err) => Ok(PathKind::NotExisting),
            Err(err) => Err(err),
        }
    }

    pub fn exists(&self, branch: usize, parts: &[&str]) -> Result<bool> {
        match self.lstat(branch, parts) {
            Ok(_) => Ok(true),
            Err(err) if probe_missed(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // Extended attributes have no `*at` form on Linux; both backends take
    // the full-path `l*` variants, so these calls are the one family that
    // is not immune to a rename of the branch root.

    pub fn getxattr(
        &self,
        branch: usize,
        parts: &[&str],
        name: &str,
        value: &mut [u8],
    ) -> Result<usize> {
        let full = self.full_path(branch, parts)?;
        rustix::fs::lgetxattr(&full, name, value).map_err(xattr_err("getxattr"))
    }

    pub fn setxattr(
        &self,
        branch: usize,
        parts: &[&str],
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> Result<()> {
        let full = self.full_path(branch, parts)?;
        rustix::fs::lsetxattr(&full, name, value, flags).map_err(xattr_err("setxattr"))
    }

    pub fn listxattr(&self, branch: usize, parts: &[&str], list: &mut [u8]) -> Result<usize> {
        let full = self.full_path(branch, parts)?;
        rustix::fs::llistxattr(&full, list).map_err(xattr_err("listxattr"))
    }

    pub fn removexattr(&self, branch: usize, parts: &[&str], name: &str) -> Result<()> {
        let full = self.full_path(branch, parts)?;
        rustix::fs::lremovexattr(&full, name).map_err(xattr_err("removexattr"))
    }

    fn full_path(&self, branch: usize, parts: &[&str]) -> Result<std::path::PathBuf> {
        let (branch, path) = self.target(branch, parts)?;
        path.under(&branch.root_path)
    }
}

fn probe_missed(err: &UnionFsError) -> bool {
    matches!(err.errno(), Errno::NOENT | Errno::NOTDIR)
}

fn xattr_err(op: &'static str) -> impl Fn(Errno) -> UnionFsError {
    move |errno| {
        if errno == Errno::LOOP {
            UnionFsError::XattrNotSupported
        } else {
            UnionFsError::syscall(op, errno)
        }
    }
}
