//! Unified (v2) hierarchy lookup.

use std::path::{Path, PathBuf};

use wasmshim_common::error::{Result, ShimError};

/// Group of a process in the unified hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedCgroup {
    path: PathBuf,
}

impl UnifiedCgroup {
    /// Opens the group at `relative` below the hierarchy root.
    ///
    /// # Errors
    ///
    /// Returns an error if the group directory does not exist.
    pub fn load(root: &Path, relative: &str, pid: u32) -> Result<Self> {
        let path = root.join(relative.trim_start_matches('/'));
        if !path.is_dir() {
            return Err(ShimError::Cgroup {
                pid,
                message: format!("group {} does not exist", path.display()),
            });
        }
        tracing::debug!(pid, path = %path.display(), "unified cgroup loaded");
        Ok(Self { path })
    }

    /// Returns the group directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the membership file of the group.
    #[must_use]
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }
}

/// Extracts the unified entry (`0::<path>`) from a membership file.
#[must_use]
pub fn parse_membership(contents: &str) -> Option<&str> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
}
