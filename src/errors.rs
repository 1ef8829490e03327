/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use rustix::io::Errno;
use thiserror::Error;

use crate::path::PATHLEN_MAX;

pub type Result<T> = std::result::Result<T, UnionFsError>;

/// Error surface of the engine.
///
/// Syscall failures carry the kernel's verdict unchanged; [`UnionFsError::errno`]
/// is what a FUSE front-end hands back to the VFS.
#[derive(Error, Debug)]
pub enum UnionFsError {
    /// Composed branch-local path (plus prefix, plus terminator) would
    /// exceed [`PATHLEN_MAX`].
    #[error("constructed path exceeds {PATHLEN_MAX} bytes")]
    PathTooLong,

    #[error("no branch with ordinal {0}")]
    NoSuchBranch(usize),

    /// Whiteouts and promotions target writable branches only.
    #[error("branch {0} is read-only")]
    ReadOnlyBranch(usize),

    #[error("'{op}' failed: {errno}")]
    Syscall { op: &'static str, errno: Errno },

    /// The source object disappeared between parent materialization and
    /// the copy itself, usually a racing delete.
    #[error("promotion source vanished: {0}")]
    SourceVanished(Errno),

    /// Short write, mapping failure or close failure on the destination.
    #[error("destination write failed: {0}")]
    DestinationWriteFailed(Errno),

    /// Socket objects are never copied.
    #[error("refusing to copy socket object")]
    UnsupportedType,

    /// A whiteout could not be recorded after a successful unlink/rmdir;
    /// the union view may still expose the deleted object.
    #[error("whiteout creation failed: {0}")]
    Whiteout(#[source] Box<UnionFsError>),

    /// Symlinks cannot carry user xattrs.
    #[error("extended attributes not supported on this object")]
    XattrNotSupported,
}

impl UnionFsError {
    pub(crate) fn syscall(op: &'static str, errno: Errno) -> Self {
        UnionFsError::Syscall { op, errno }
    }

    /// Numeric errno for the FUSE reply.
    pub fn errno(&self) -> Errno {
        match self {
            UnionFsError::PathTooLong => Errno::NAMETOOLONG,
            UnionFsError::NoSuchBranch(_) => Errno::INVAL,
            UnionFsError::ReadOnlyBranch(_) => Errno::ROFS,
            UnionFsError::Syscall { errno, .. } => *errno,
            UnionFsError::SourceVanished(errno) => *errno,
            UnionFsError::DestinationWriteFailed(errno) => *errno,
            UnionFsError::UnsupportedType => Errno::NOTSUP,
            UnionFsError::Whiteout(inner) => inner.errno(),
            UnionFsError::XattrNotSupported => Errno::NOTSUP,
        }
    }

    /// True when the underlying verdict was `ENOENT`.
    pub fn is_not_found(&self) -> bool {
        self.errno() == Errno::NOENT
    }
}

/// Errno of an `std::io` failure, for the file descriptors the engine
/// drives through `std::fs::File`.
pub(crate) fn io_errno(err: &std::io::Error) -> Errno {
    match err.raw_os_error() {
        Some(raw) => Errno::from_raw_os_error(raw),
        None => Errno::IO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(UnionFsError::PathTooLong.errno(), Errno::NAMETOOLONG);
        assert_eq!(UnionFsError::UnsupportedType.errno(), Errno::NOTSUP);
        assert_eq!(
            UnionFsError::syscall("unlink", Errno::PERM).errno(),
            Errno::PERM
        );
        let wrapped = UnionFsError::Whiteout(Box::new(UnionFsError::syscall(
            "mkdir",
            Errno::NOSPC,
        )));
        assert_eq!(wrapped.errno(), Errno::NOSPC);
    }
}
