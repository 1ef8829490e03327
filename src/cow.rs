/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::ffi::c_void;
use std::fs::File;
use std::io::Read;
use std::os::fd::IntoRawFd;
use std::ptr;
use std::slice;

use log::{debug, warn};
use rustix::fs::{FileType, Mode, OFlags, Stat};
use rustix::io::Errno;
use rustix::mm::{self, Advice, MapFlags, ProtFlags};
use rustix::process;

use crate::branchio::BranchIo;
use crate::errors::{io_errno, Result, UnionFsError};
use crate::path::{dirname, prefixes, BranchPath, PATHLEN_MAX};

/// Sources up to this size are copied through one shared mapping; larger
/// ones go through the bounce buffer.
const MMAP_COPY_LIMIT: u64 = 8 * 1024 * 1024;

/// Bounce buffer size for the large-file path.
const COPY_CHUNK: usize = 4096;

/// Mode used for plain `mkdir -p` chains (metadata directories).
const PLAIN_CHAIN_MODE: u32 = 0o770;

/// Object types a promotion can encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn from_raw_mode(st_mode: u32) -> Option<FileKind> {
        match FileType::from_raw_mode(st_mode) {
            FileType::RegularFile => Some(FileKind::Regular),
            FileType::Directory => Some(FileKind::Directory),
            FileType::Symlink => Some(FileKind::Symlink),
            FileType::BlockDevice => Some(FileKind::BlockDevice),
            FileType::CharacterDevice => Some(FileKind::CharDevice),
            FileType::Fifo => Some(FileKind::Fifo),
            FileType::Socket => Some(FileKind::Socket),
            _ => None,
        }
    }
}

/// Per-promotion record: where from, where to, and the process state
/// captured when the job started. Lives on the stack for one call.
struct CowJob<'a> {
    path: &'a str,
    from_branch: usize,
    to_branch: usize,
    source_stat: Stat,
    effective_umask: u32,
    acting_uid: u32,
}

/// Copy-on-write promotion of objects from a read-only branch onto a
/// writable one.
///
/// The engine is synchronous, holds no locks, and keeps no state besides
/// the umask captured at construction; concurrent promotions of the same
/// path may both succeed, with the later metadata application winning.
pub struct CowEngine<'a> {
    io: &'a BranchIo,
    effective_umask: u32,
}

impl<'a> CowEngine<'a> {
    pub fn new(io: &'a BranchIo) -> CowEngine<'a> {
        // The only umask mutation in the crate: read it once by swapping
        // zero in and the prior value straight back. Creation paths pass
        // explicit modes and exact modes are re-applied afterwards, so the
        // mask only feeds the setuid preservation rule.
        let prior = process::umask(Mode::empty());
        process::umask(prior);
        CowEngine {
            io,
            effective_umask: prior.bits(),
        }
    }

    /// Materialize `path` from `ro_branch` onto `rw_branch`: parents
    /// first, then the object itself, dispatched on its type.
    ///
    /// Nothing is cleaned up on failure; a later attempt finds and
    /// overwrites whatever was left behind.
    pub fn promote(&self, path: &str, ro_branch: usize, rw_branch: usize) -> Result<()> {
        debug!(
            "promote '{}' from branch {} to branch {}",
            path, ro_branch, rw_branch
        );
        let target = self.io.branch(rw_branch)?;
        if !target.is_writable() {
            return Err(UnionFsError::ReadOnlyBranch(rw_branch));
        }

        create_path_chain(self.io, dirname(path), ro_branch, rw_branch)?;

        let source_stat = self
            .io
            .lstat(ro_branch, &[path])
            .map_err(|err| UnionFsError::SourceVanished(err.errno()))?;
        let job = CowJob {
            path,
            from_branch: ro_branch,
            to_branch: rw_branch,
            source_stat,
            effective_umask: self.effective_umask,
            acting_uid: process::getuid().as_raw(),
        };

        match FileKind::from_raw_mode(source_stat.st_mode) {
            Some(FileKind::Regular) => self.copy_file(&job),
            Some(FileKind::Directory) => self.copy_directory(path, ro_branch, rw_branch),
            Some(FileKind::Symlink) => self.copy_link(&job),
            Some(FileKind::Fifo) => self.copy_fifo(&job),
            Some(FileKind::BlockDevice) | Some(FileKind::CharDevice) => self.copy_special(&job),
            Some(FileKind::Socket) | None => {
                warn!("refusing to copy socket '{}'", path);
                Err(UnionFsError::UnsupportedType)
            }
        }
    }

    /// Recursively promote a directory and everything below it.
    pub fn copy_directory(&self, path: &str, ro_branch: usize, rw_branch: usize) -> Result<()> {
        create_path_chain(self.io, path, ro_branch, rw_branch)?;

        // The entry stream closes on drop no matter which child fails.
        let entries = self.io.opendir(ro_branch, &[path])?;
        for name in entries {
            if name == "." || name == ".." {
                continue;
            }
            let Some(name) = name.to_str() else {
                return Err(UnionFsError::syscall("readdir", Errno::ILSEQ));
            };
            let child = if path == "/" {
                BranchPath::compose(&["/", name])?
            } else {
                BranchPath::compose(&[path, "/", name])?
            };
            self.promote(child.as_str(), ro_branch, rw_branch)?;
        }
        Ok(())
    }

    fn copy_file(&self, job: &CowJob) -> Result<()> {
        let mut source = self.io.open(
            job.from_branch,
            &[job.path],
            OFlags::RDONLY,
            Mode::empty(),
        )?;
        // Created without setuid/setgid/sticky; the preservation rule
        // below decides whether any of them come back.
        let create_mode = Mode::from_bits_truncate(job.source_stat.st_mode & 0o777);
        let dest = self.io.open(
            job.to_branch,
            &[job.path],
            OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC,
            create_mode,
        )?;
        let dest_stat =
            rustix::fs::fstat(&dest).map_err(|e| UnionFsError::syscall("fstat", e))?;

        let size = job.source_stat.st_size as u64;
        if size > 0 && size <= MMAP_COPY_LIMIT {
            let map = SharedMap::new(&source, size as usize)?;
            let written = rustix::io::write(&dest, map.as_slice())
                .map_err(UnionFsError::DestinationWriteFailed)?;
            if written != map.len() {
                return Err(UnionFsError::DestinationWriteFailed(Errno::IO));
            }
        } else if size > 0 {
            let mut buf = [0u8; COPY_CHUNK];
            loop {
                let n = source
                    .read(&mut buf)
                    .map_err(|e| UnionFsError::syscall("read", io_errno(&e)))?;
                if n == 0 {
                    break;
                }
                let written = rustix::io::write(&dest, &buf[..n])
                    .map_err(UnionFsError::DestinationWriteFailed)?;
                if written != n {
                    return Err(UnionFsError::DestinationWriteFailed(Errno::IO));
                }
            }
        }

        setfile(self.io, job.to_branch, job.path, &job.source_stat)?;

        // Historical BSD cp rule: setuid/setgid survive only when the
        // source is owned by the acting user and the destination landed in
        // the source's group; otherwise they stay dropped.
        if job.source_stat.st_mode & 0o6000 != 0 {
            let mode = if job.source_stat.st_uid == job.acting_uid
                && dest_stat.st_gid == job.source_stat.st_gid
            {
                job.source_stat.st_mode & 0o7777 & !job.effective_umask
            } else {
                job.source_stat.st_mode & 0o777
            };
            rustix::fs::fchmod(&dest, Mode::from_bits_truncate(mode))
                .map_err(|e| UnionFsError::syscall("chmod", e))?;
        }

        close_destination(dest)
    }

    fn copy_link(&self, job: &CowJob) -> Result<()> {
        let target = self.io.readlink(job.from_branch, &[job.path])?;
        if target.len() + 1 > PATHLEN_MAX {
            return Err(UnionFsError::PathTooLong);
        }
        self.io.symlink(&target, job.to_branch, &[job.path])?;
        // Owner and group only: symlinks carry neither mode nor reliable
        // timestamps across platforms.
        self.io.lchown(
            job.to_branch,
            &[job.path],
            job.source_stat.st_uid,
            job.source_stat.st_gid,
        )
    }

    fn copy_fifo(&self, job: &CowJob) -> Result<()> {
        self.io.mkfifo(
            job.to_branch,
            &[job.path],
            Mode::from_bits_truncate(job.source_stat.st_mode & 0o7777),
        )?;
        setfile(self.io, job.to_branch, job.path, &job.source_stat)
    }

    fn copy_special(&self, job: &CowJob) -> Result<()> {
        let kind = match FileKind::from_raw_mode(job.source_stat.st_mode) {
            Some(FileKind::BlockDevice) => FileType::BlockDevice,
            _ => FileType::CharacterDevice,
        };
        self.io.mknod(
            job.to_branch,
            &[job.path],
            kind,
            Mode::from_bits_truncate(job.source_stat.st_mode & 0o7777),
            job.source_stat.st_rdev,
        )?;
        setfile(self.io, job.to_branch, job.path, &job.source_stat)
    }
}

/// Walk `path` component by component and make every missing prefix exist
/// on `rw_branch`, carrying mode, ownership and timestamps over from
/// `ro_branch`. Already-present prefixes are skipped, which makes the walk
/// idempotent.
///
/// With `ro_branch == rw_branch` this degrades to a plain `mkdir -p` with
/// mode `rwxrwx---` and no metadata transfer; the whiteout store uses that
/// form for the metadata tree.
pub(crate) fn create_path_chain(
    io: &BranchIo,
    path: &str,
    ro_branch: usize,
    rw_branch: usize,
) -> Result<()> {
    let plain = ro_branch == rw_branch;
    for prefix in prefixes(path) {
        if io.exists(rw_branch, &[prefix])? {
            continue;
        }
        if plain {
            let mode = Mode::from_bits_truncate(PLAIN_CHAIN_MODE);
            io.mkdir(rw_branch, &[prefix], mode)?;
            // The kernel masked the mkdir mode with the process umask;
            // re-apply the exact one.
            io.chmod(rw_branch, &[prefix], mode)?;
        } else {
            let stat = io
                .lstat(ro_branch, &[prefix])
                .map_err(|err| UnionFsError::SourceVanished(err.errno()))?;
            io.mkdir(
                rw_branch,
                &[prefix],
                Mode::from_bits_truncate(stat.st_mode & 0o7777),
            )?;
            setfile(io, rw_branch, prefix, &stat).map_err(|err| {
                if err.errno() == Errno::NOENT {
                    // Removed in flight between mkdir and the transfer.
                    UnionFsError::SourceVanished(Errno::NOENT)
                } else {
                    err
                }
            })?;
        }
    }
    Ok(())
}

/// Transfer timestamps, ownership and mode from a source stat onto the
/// object at `path`. A chown refused with EPERM degrades to dropping the
/// setuid/setgid/sticky bits and carries on; Linux has no chflags, so
/// file-flag transfer does not apply here.
pub(crate) fn setfile(io: &BranchIo, branch: usize, path: &str, stat: &Stat) -> Result<()> {
    // Second resolution only; the source record carries no nanoseconds.
    io.utimens(branch, &[path], stat.st_atime, stat.st_mtime)?;

    let mut mode = stat.st_mode & 0o6777;
    match io.chown(branch, &[path], stat.st_uid, stat.st_gid) {
        Ok(()) => {}
        Err(err) if err.errno() == Errno::PERM => {
            warn!(
                "cannot give '{}' to {}:{}, dropping set-id bits",
                path, stat.st_uid, stat.st_gid
            );
            mode &= !0o7000;
        }
        Err(err) => return Err(err),
    }
    io.chmod(branch, &[path], Mode::from_bits_truncate(mode))
}

/// Close the destination explicitly: `File`'s drop would discard the
/// kernel's verdict, and a failed close means lost data.
fn close_destination(dest: File) -> Result<()> {
    let fd = dest.into_raw_fd();
    if unsafe { libc::close(fd) } != 0 {
        let err = std::io::Error::last_os_error();
        return Err(UnionFsError::DestinationWriteFailed(io_errno(&err)));
    }
    Ok(())
}

/// Shared read-only mapping of a source file, unmapped on drop on every
/// exit path.
struct SharedMap {
    addr: *mut c_void,
    len: usize,
}

impl SharedMap {
    fn new(file: &File, len: usize) -> Result<SharedMap> {
        // Safety: mapping `len` bytes of a file we hold open; the region
        // is ours until munmap in drop.
        let addr = unsafe {
            mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::SHARED,
                file,
                0,
            )
        }
        .map_err(UnionFsError::DestinationWriteFailed)?;
        // Access-pattern hint only; not worth failing the copy over.
        let _ = unsafe { mm::madvise(addr, len, Advice::Sequential) };
        Ok(SharedMap { addr, len })
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        // Safety: the mapping stays valid for self's lifetime.
        unsafe { slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        // Safety: addr/len came from a successful mmap.
        let _ = unsafe { mm::munmap(self.addr, self.len) };
    }
}
