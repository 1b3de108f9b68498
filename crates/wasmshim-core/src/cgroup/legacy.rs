//! Legacy (v1) per-subsystem lookup.
//!
//! Each line of `/proc/<pid>/cgroup` has the form
//! `<hierarchy-id>:<controller,...>:<path>`. Every controller is mounted as
//! its own directory below the cgroup root (co-mounted controllers are
//! reachable through per-controller symlinks), and named hierarchies such
//! as `name=systemd` are mounted under their bare name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use wasmshim_common::error::{Result, ShimError};

/// Groups of a process across the legacy subsystem hierarchies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyCgroup {
    paths: BTreeMap<String, PathBuf>,
}

impl LegacyCgroup {
    /// Builds the per-subsystem paths from a membership file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file names no v1 subsystem.
    pub fn load(root: &Path, membership: &str, pid: u32) -> Result<Self> {
        let paths: BTreeMap<_, _> = parse_membership(membership)
            .into_iter()
            .map(|(subsystem, relative)| {
                let dir = root
                    .join(&subsystem)
                    .join(relative.trim_start_matches('/'));
                (subsystem, dir)
            })
            .collect();
        if paths.is_empty() {
            return Err(ShimError::Cgroup {
                pid,
                message: "no legacy subsystems listed".into(),
            });
        }
        tracing::debug!(pid, subsystems = paths.len(), "legacy cgroup loaded");
        Ok(Self { paths })
    }

    /// Returns the group directory for one subsystem.
    #[must_use]
    pub fn path(&self, subsystem: &str) -> Option<&Path> {
        self.paths.get(subsystem).map(PathBuf::as_path)
    }

    /// Iterates over the subsystem names.
    pub fn subsystems(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }
}

/// Splits a membership file into `(subsystem, path)` pairs, skipping the
/// unified entry.
#[must_use]
pub fn parse_membership(contents: &str) -> Vec<(String, &str)> {
    let mut out = Vec::new();
    for line in contents.lines() {
        let mut fields = line.splitn(3, ':');
        let (Some(_id), Some(controllers), Some(path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if controllers.is_empty() {
            continue;
        }
        for controller in controllers.split(',') {
            let name = controller.strip_prefix("name=").unwrap_or(controller);
            out.push((name.to_string(), path.trim()));
        }
    }
    out
}
