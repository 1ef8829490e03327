/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;

use rustix::fs::{
    self, AtFlags, Dir, FileType, Gid, Mode, OFlags, Stat, StatFs, Timestamps, Uid,
};
use rustix::io::Errno;

use crate::branch::Branch;
use crate::errors::{Result, UnionFsError};
use crate::path::BranchPath;

use super::Backend;

/// Issues every operation against the branch's long-lived root descriptor
/// with the `*at` family, handing the kernel the relative form of the
/// path. Keeps working if the branch root is renamed underneath a running
/// mount.
pub(crate) struct HandleBackend;

fn root(branch: &Branch) -> Result<BorrowedFd<'_>> {
    branch
        .root_handle
        .as_ref()
        .map(|fd| fd.as_fd())
        .ok_or(UnionFsError::Syscall {
            op: "branch handle",
            errno: Errno::BADF,
        })
}

fn sys(op: &'static str) -> impl Fn(Errno) -> UnionFsError {
    move |errno| UnionFsError::syscall(op, errno)
}

impl Backend for HandleBackend {
    fn stat(&self, branch: &Branch, path: &BranchPath) -> Result<Stat> {
        fs::statat(root(branch)?, path.relative(), AtFlags::empty()).map_err(sys("stat"))
    }

    fn lstat(&self, branch: &Branch, path: &BranchPath) -> Result<Stat> {
        fs::statat(root(branch)?, path.relative(), AtFlags::SYMLINK_NOFOLLOW)
            .map_err(sys("lstat"))
    }

    fn open(
        &self,
        branch: &Branch,
        path: &BranchPath,
        flags: OFlags,
        mode: Mode,
    ) -> Result<OwnedFd> {
        fs::openat(root(branch)?, path.relative(), flags | OFlags::CLOEXEC, mode)
            .map_err(sys("open"))
    }

    fn read_dir(&self, branch: &Branch, path: &BranchPath) -> Result<Vec<OsString>> {
        let fd = fs::openat(
            root(branch)?,
            path.relative(),
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
        fs::mkdirat(root(branch)?, path.relative(), mode).map_err(sys("mkdir"))
    }

    fn rmdir(&self, branch: &Branch, path: &BranchPath) -> Result<()> {
        fs::unlinkat(root(branch)?, path.relative(), AtFlags::REMOVEDIR).map_err(sys("rmdir"))
    }

    fn unlink(&self, branch: &Branch, path: &BranchPath) -> Result<()> {
        fs::unlinkat(root(branch)?, path.relative(), AtFlags::empty()).map_err(sys("unlink"))
    }

    fn link(
        &self,
        old_branch: &Branch,
        old_path: &BranchPath,
        new_branch: &Branch,
        new_path: &BranchPath,
    ) -> Result<()> {
        fs::linkat(
            root(old_branch)?,
            old_path.relative(),
            root(new_branch)?,
            new_path.relative(),
            AtFlags::empty(),
        )
        .map_err(sys("link"))
    }

    fn symlink(&self, target: &OsStr, branch: &Branch, path: &BranchPath) -> Result<()> {
        fs::symlinkat(target, root(branch)?, path.relative()).map_err(sys("symlink"))
    }

    fn readlink(&self, branch: &Branch, path: &BranchPath) -> Result<OsString> {
        let target = fs::readlinkat(root(branch)?, path.relative(), Vec::new())
            .map_err(sys("readlink"))?;
        Ok(OsString::from_vec(target.into_bytes()))
    }

    fn chmod(&self, branch: &Branch, path: &BranchPath, mode: Mode) -> Result<()> {
        fs::chmodat(root(branch)?, path.relative(), mode, AtFlags::empty())
            .map_err(sys("chmod"))
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
        fs::chownat(root(branch)?, path.relative(), Some(owner), Some(group), flags)
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
        fs::mknodat(root(branch)?, path.relative(), kind, mode, dev).map_err(sys("mknod"))
    }

    fn rename(&self, branch: &Branch, old_path: &BranchPath, new_path: &BranchPath) -> Result<()> {
        let fd = root(branch)?;
        fs::renameat(fd, old_path.relative(), fd, new_path.relative()).map_err(sys("rename"))
    }

    fn truncate(&self, branch: &Branch, path: &BranchPath, length: u64) -> Result<()> {
        // No truncateat exists; go through an fd.
        let fd = fs::openat(
            root(branch)?,
            path.relative(),
            OFlags::WRONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(sys("truncate"))?;
        fs::ftruncate(&fd, length).map_err(sys("truncate"))
    }

    fn utimens(&self, branch: &Branch, path: &BranchPath, times: &Timestamps) -> Result<()> {
        fs::utimensat(
            root(branch)?,
            path.relative(),
            times,
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .map_err(sys("utimens"))
    }

    fn statfs(&self, branch: &Branch, path: &BranchPath) -> Result<StatFs> {
        // No statfsat exists either; O_PATH is enough for fstatfs.
        let fd = fs::openat(
            root(branch)?,
            path.relative(),
            OFlags::PATH | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(sys("statfs"))?;
        fs::fstatfs(&fd).map_err(sys("statfs"))
    }
}
