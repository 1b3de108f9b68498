//! The subset of an OCI bundle configuration the shim consumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use wasmshim_common::constants;
use wasmshim_common::error::{Result, ShimError};

/// Runtime configuration read from `<bundle>/config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleSpec {
    /// Process to run.
    #[serde(default)]
    pub process: Option<ProcessSpec>,
    /// Declared root filesystem.
    #[serde(default)]
    pub root: Option<Root>,
    /// Free-form annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Process section of the bundle configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessSpec {
    /// Command and arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Vec<String>,
    /// Whether a terminal was requested.
    #[serde(default)]
    pub terminal: bool,
}

/// Root section of the bundle configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Root {
    /// Root filesystem path, absolute or relative to the bundle.
    #[serde(default)]
    pub path: String,
    /// Whether the root filesystem is read-only.
    #[serde(default)]
    pub readonly: bool,
}

impl BundleSpec {
    /// Reads and parses the configuration of the bundle at `bundle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(constants::BUNDLE_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| ShimError::Io {
            path: path.clone(),
            source: e,
        })?;
        let spec: Self = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "bundle config loaded");
        Ok(spec)
    }

    /// Returns the process section.
    ///
    /// # Errors
    ///
    /// Returns [`ShimError::InvalidArgument`] if the bundle declares no process.
    pub fn process(&self) -> Result<&ProcessSpec> {
        self.process
            .as_ref()
            .ok_or_else(|| ShimError::invalid_argument("no process specification"))
    }

    /// Returns the declared root resolved against `bundle`, if any.
    #[must_use]
    pub fn root_path(&self, bundle: &Path) -> Option<PathBuf> {
        let root = self.root.as_ref().filter(|r| !r.path.is_empty())?;
        Some(bundle.join(&root.path))
    }

    /// Returns whether the container-type annotation marks a sandbox.
    ///
    /// A missing annotation counts as a sandbox.
    #[must_use]
    pub fn is_sandbox(&self) -> bool {
        self.annotations
            .get(constants::CONTAINER_TYPE_ANNOTATION)
            .is_none_or(|kind| kind == constants::CONTAINER_TYPE_SANDBOX)
    }
}

/// Splits `KEY=VALUE` entries into ordered pairs.
///
/// # Errors
///
/// Returns [`ShimError::InvalidArgument`] for entries without `=` or with
/// an empty key.
pub fn parse_env(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ShimError::invalid_argument(format!(
                "malformed environment entry {entry:?}"
            ))),
        })
        .collect()
}
