/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::ffi::{OsStr, OsString};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use rustix::fs::{
    self, AtFlags, Dir, FileType, Gid, Mode, OFlags, Stat, StatFs, Timestamps, Uid, CWD,
};
use rustix::io::Errno;

use crate::branch::Branch;
use crate::errors::{Result, UnionFsError};
use crate::path::BranchPath;

use super::Backend;

/// Issues every operation against the absolute path formed by prepending
/// the branch root. The portable fallback: no handles held, but a rename
/// of the branch root under a running mount leaves it pointing nowhere.
pub(crate) struct PrefixBackend;

fn full(branch: &Branch, path: &BranchPath) -> Result<PathBuf> {
    path.under(&branch.root_path)
}

fn sys(op: &'static str) -> impl Fn(Errno) -> UnionFsError {
    move |errno| UnionFsError::syscall(op, errno)
}

impl Backend for PrefixBackend {
    fn stat(&self, branch: &Branch, path: &BranchPath) -> Result<Stat> {
        fs::statat(CWD, full(branch, path)?, AtFlags::empty()).map_err(sys("stat"))
    }

    fn lstat(&self, branch: &Branch, path: &BranchPath) -> Result<Stat> {
        fs::statat(CWD, full(branch, path)?, AtFlags::SYMLINK_NOFOLLOW).map_err(sys("lstat"))
    }

    fn open(
        &self,
        branch: &Branch,
        path: &BranchPath,
        flags: OFlags,
        mode: Mode,
    ) -> Result<OwnedFd> {
        fs::openat(CWD, full(branch, path)?, flags | OFlags::CLOEXEC, mode).map_err(sys("open"))
    }

    fn read_dir(&self, branch: &Branch, path: &BranchPath) -> Result<Vec<OsString>> {
        let fd = fs::openat(
            CWD,
            full(branch, path)?,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(sys("opendir"))?;
        let dir = Dir::read_from(&fd).map_err(sys("opendir"))?;
        let mut names = Vec::new();
        for entry in dir {
            let entry = entry.map_err(sys("readdir"))?;
            names.push(OsString::from_vec(entry.file_name().to_bytes().to_vec()));
        }
        Ok(names)
    }

    fn mkdir(&self, branch: &Branch, path: &BranchPath, mode: Mode) -> Result<()> {
        fs::mkdirat(CWD, full(branch, path)?, mode).map_err(sys("mkdir"))
    }

    fn rmdir(&self, branch: &Branch, path: &BranchPath) -> Result<()> {
        fs::unlinkat(CWD, full(branch, path)?, AtFlags::REMOVEDIR).map_err(sys("rmdir"))
    }

    fn unlink(&self, branch: &Branch, path: &BranchPath) -> Result<()> {
        fs::unlinkat(CWD, full(branch, path)?, AtFlags::empty()).map_err(sys("unlink"))
    }

    fn link(
        &self,
        old_branch: &Branch,
        old_path: &BranchPath,
        new_branch: &Branch,
        new_path: &BranchPath,
    ) -> Result<()> {
        fs::linkat(
            CWD,
            full(old_branch, old_path)?,
            CWD,
            full(new_branch, new_path)?,
            AtFlags::empty(),
        )
        .map_err(sys("link"))
    }

    fn symlink(&self, target: &OsStr, branch: &Branch, path: &BranchPath) -> Result<()> {
        fs::symlinkat(target, CWD, full(branch, path)?).map_err(sys("symlink"))
    }

    fn readlink(&self, branch: &Branch, path: &BranchPath) -> Result<OsString> {
        let target = fs::readlinkat(CWD, full(branch, path)?, Vec::new())
            .map_err(sys("readlink"))?;
        Ok(OsString::from_vec(target.into_bytes()))
    }

    fn chmod(&self, branch: &Branch, path: &BranchPath, mode: Mode) -> Result<()> {
        fs::chmodat(CWD, full(branch, path)?, mode, AtFlags::empty()).map_err(sys("chmod"))
    }

    fn chown(
        &self,
        branch: &Branch,
        path: &BranchPath,
        uid: u32,
        gid: u32,
        follow: bool,
    ) -> Result<()> {
        let flags = if follow {
            AtFlags::empty()
        } else {
            AtFlags::SYMLINK_NOFOLLOW
        };
        // Safety: forwarding ids the kernel already vouched for (stat or
        // the acting context).
        let (owner, group) = unsafe { (Uid::from_raw(uid), Gid::from_raw(gid)) };
        fs::chownat(CWD, full(branch, path)?, Some(owner), Some(group), flags)
            .map_err(sys("chown"))
    }

    fn mknod(
        &self,
        branch: &Branch,
        path: &BranchPath,
        kind: FileType,
        mode: Mode,
        dev: u64,
    ) -> Result<()> {
        fs::mknodat(CWD, full(branch, path)?, kind, mode, dev).map_err(sys("mknod"))
    }

    fn rename(&self, branch: &Branch, old_path: &BranchPath, new_path: &BranchPath) -> Result<()> {
        fs::renameat(
            CWD,
            full(branch, old_path)?,
            CWD,
            full(branch, new_path)?,
        )
        .map_err(sys("rename"))
    }

    fn truncate(&self, branch: &Branch, path: &BranchPath, length: u64) -> Result<()> {
        let fd = fs::openat(
            CWD,
            full(branch, path)?,
            OFlags::WRONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(sys("truncate"))?;
        fs::ftruncate(&fd, length).map_err(sys("truncate"))
    }

    fn utimens(&self, branch: &Branch, path: &BranchPath, times: &Timestamps) -> Result<()> {
        fs::utimensat(CWD, full(branch, path)?, times, AtFlags::SYMLINK_NOFOLLOW)
            .map_err(sys("utimens"))
    }

    fn statfs(&self, branch: &Branch, path: &BranchPath) -> Result<StatFs> {
        fs::statfs(full(branch, path)?).map_err(sys("statfs"))
    }
}
