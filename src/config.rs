/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::branch::BranchMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    /// Promote objects from read-only branches on first mutation. With this
    /// off all whiteout queries answer "not hidden" and hide requests are
    /// accepted no-ops.
    pub cow_enabled: bool,
    /// How branch-local paths reach the kernel, fixed for the process.
    #[serde(default)]
    pub backend: BackendKind,
    /// Reserved top-level directory holding hide markers on each writable
    /// branch. Paths starting with this component are not user-visible.
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: String,
    /// Reserved terminal name of a hide marker.
    #[serde(default = "default_hide_tag")]
    pub hide_tag: String,
    /// Underlying directories, ordered highest priority first. Position in
    /// this list is the branch ordinal.
    pub branches: Vec<BranchConfig>,
}

/// The two interchangeable ways of addressing a branch.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Issue `*at` syscalls against a directory handle opened at mount
    /// time. Immune to the branch root being renamed underneath a running
    /// mount.
    #[default]
    Handle,
    /// Prepend the branch root to every path.
    Prefix,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct BranchConfig {
    pub path: PathBuf,
    pub mode: BranchMode,
}

fn default_metadata_dir() -> String {
    ".unionfs".to_owned()
}

fn default_hide_tag() -> String {
    "__HIDDEN__".to_owned()
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.check()?;
        Ok(config)
    }

    /// Stack invariants: at least one branch, and a writable one when COW
    /// is on.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.branches.is_empty() {
            return Err(ConfigError::Invalid("no branches configured".into()));
        }
        if self.cow_enabled && !self.branches.iter().any(|b| b.mode == BranchMode::Rw) {
            return Err(ConfigError::Invalid(
                "copy-on-write requires at least one writable branch".into(),
            ));
        }
        if self.metadata_dir.is_empty() || self.metadata_dir.contains('/') {
            return Err(ConfigError::Invalid(
                "metadata directory must be a single path component".into(),
            ));
        }
        if self.hide_tag.is_empty() || self.hide_tag.contains('/') {
            return Err(ConfigError::Invalid(
                "hide tag must be a single path component".into(),
            ));
        }
        Ok(())
    }
}
