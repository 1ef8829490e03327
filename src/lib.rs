/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Copy-on-write core of a union filesystem.
//!
//! A stack of underlying directories ("branches"), each read-only or
//! read-write, is presented by a front-end as one merged namespace. This
//! crate implements the machinery underneath that view:
//!
//! * [`BranchIo`] — every directory-entry syscall, addressed to a branch
//!   ordinal, through one of two interchangeable backends (a long-lived
//!   directory handle with the `*at` family, or plain path prefixing);
//! * [`CowEngine`] — promotion of an object from a read-only branch onto
//!   a writable one: parent materialization, type-dispatched copy,
//!   metadata transfer;
//! * [`WhiteoutStore`] — hide markers that make deleted read-only objects
//!   disappear from the merged view, plus the per-lookup hiding checks.
//!
//! The front-end (FUSE callbacks, branch discovery, directory-merge
//! fan-out) stays outside; it drives this crate through the types above
//! and a [`BranchFinder`] it supplies.

pub mod branch;
pub mod branchio;
pub mod config;
pub mod cow;
pub mod errors;
pub mod path;
pub mod whiteout;

pub use branch::{Branch, BranchFinder, BranchMode};
pub use branchio::{BranchIo, PathKind};
pub use config::{BackendKind, BranchConfig, Config, ConfigError};
pub use cow::{CowEngine, FileKind};
pub use errors::{Result, UnionFsError};
pub use path::{BranchPath, PATHLEN_MAX};
pub use whiteout::{WhiteoutKind, WhiteoutStore};
