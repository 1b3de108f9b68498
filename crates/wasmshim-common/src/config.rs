//! Runtime configuration for the shim.
//!
//! Values default to the constants in [`crate::constants`] and can be
//! loaded from a JSON document; every field is optional in the document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, ShimError};

/// Root configuration for the shim runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Engine executable used for guest-mode launches.
    pub engine: String,
    /// Capacity of the exit-event channel handed to containers.
    pub exit_channel_capacity: usize,
    /// Cgroup filesystem mount point.
    pub cgroup_root: PathBuf,
    /// Procfs mount point.
    pub proc_root: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: constants::DEFAULT_ENGINE.to_string(),
            exit_channel_capacity: constants::DEFAULT_EXIT_CHANNEL_CAPACITY,
            cgroup_root: PathBuf::from(constants::CGROUP_ROOT),
            proc_root: PathBuf::from(constants::PROC_ROOT),
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration document from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ShimError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Resolves the configured engine to an absolute path via `PATH`.
    ///
    /// Falls back to the configured value when the lookup fails so that
    /// the spawn reports the missing binary.
    #[must_use]
    pub fn resolve_engine(&self) -> String {
        match which::which(&self.engine) {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                tracing::warn!(engine = %self.engine, error = %e, "engine not found on PATH");
                self.engine.clone()
            }
        }
    }
}
