//! Cgroup discovery for running processes.
//!
//! The shim never creates cgroups or applies limits; it only finds the group
//! an already-running process was placed in. Which lookup applies depends on
//! how the host mounted the cgroup filesystem, so discovery is keyed on a
//! single [`CgroupMode`] query.

pub mod legacy;
pub mod unified;

use std::fmt;
use std::path::{Path, PathBuf};

use wasmshim_common::constants;
use wasmshim_common::error::{Result, ShimError};

pub use legacy::LegacyCgroup;
pub use unified::UnifiedCgroup;

/// How the cgroup filesystem is mounted on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    /// Per-subsystem v1 hierarchies only.
    Legacy,
    /// v1 hierarchies with a v2 tree mounted at `unified/`.
    Hybrid,
    /// A single v2 hierarchy.
    Unified,
    /// No cgroup filesystem found.
    Unavailable,
}

/// The resource group a process belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupHandle {
    /// Group in the unified (v2) hierarchy.
    Unified(UnifiedCgroup),
    /// Per-subsystem groups in the legacy (v1) hierarchies.
    Legacy(LegacyCgroup),
}

impl CgroupHandle {
    /// Returns the hierarchy version of this handle.
    #[must_use]
    pub const fn version(&self) -> u8 {
        match self {
            Self::Unified(_) => 2,
            Self::Legacy(_) => 1,
        }
    }
}

impl fmt::Display for CgroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unified(cg) => write!(f, "v2:{}", cg.path().display()),
            Self::Legacy(cg) => write!(f, "v1:{} subsystems", cg.subsystems().count()),
        }
    }
}

/// Resolves the cgroup of a running process.
///
/// [`CgroupHierarchy`] is the host implementation; the seam exists so
/// callers can be exercised without a mounted cgroup filesystem.
pub trait CgroupResolver: Send + Sync {
    /// Finds the cgroup the given process currently belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the process or its group cannot be found.
    fn resolve(&self, pid: u32) -> Result<CgroupHandle>;
}

/// Location of the cgroup and proc filesystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHierarchy {
    root: PathBuf,
    proc_root: PathBuf,
}

impl CgroupHierarchy {
    /// Creates a hierarchy rooted at custom mount points.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            proc_root: proc_root.into(),
        }
    }

    /// Returns the host hierarchy at `/sys/fs/cgroup` and `/proc`.
    #[must_use]
    pub fn system() -> Self {
        Self::new(constants::CGROUP_ROOT, constants::PROC_ROOT)
    }

    /// Returns the cgroup filesystem mount point.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Detects how the cgroup filesystem is mounted.
    #[must_use]
    pub fn mode(&self) -> CgroupMode {
        if self.root.join("cgroup.controllers").exists() {
            return CgroupMode::Unified;
        }
        if self.root.join("unified").join("cgroup.controllers").exists() {
            return CgroupMode::Hybrid;
        }
        if self.root.is_dir() {
            return CgroupMode::Legacy;
        }
        CgroupMode::Unavailable
    }

    /// Reads `/proc/<pid>/cgroup`.
    fn read_membership(&self, pid: u32) -> Result<String> {
        let path = self.proc_root.join(pid.to_string()).join("cgroup");
        std::fs::read_to_string(&path).map_err(|e| ShimError::Io { path, source: e })
    }

    /// Looks up the unified-hierarchy group of a process.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership file cannot be read, has no
    /// unified entry, or names a group that no longer exists.
    pub fn load_unified(&self, pid: u32) -> Result<UnifiedCgroup> {
        let membership = self.read_membership(pid)?;
        let relative = unified::parse_membership(&membership).ok_or_else(|| ShimError::Cgroup {
            pid,
            message: "no unified hierarchy entry".into(),
        })?;
        UnifiedCgroup::load(&self.root, relative, pid)
    }

    /// Looks up the per-subsystem groups of a process.
    ///
    /// # Errors
    ///
    /// Returns an error if the membership file cannot be read or lists no
    /// subsystems.
    pub fn load_legacy(&self, pid: u32) -> Result<LegacyCgroup> {
        let membership = self.read_membership(pid)?;
        LegacyCgroup::load(&self.root, &membership, pid)
    }
}

impl Default for CgroupHierarchy {
    fn default() -> Self {
        Self::system()
    }
}

impl CgroupResolver for CgroupHierarchy {
    fn resolve(&self, pid: u32) -> Result<CgroupHandle> {
        let mode = self.mode();
        tracing::debug!(pid, ?mode, "resolving cgroup");
        match mode {
            CgroupMode::Unified => self.load_unified(pid).map(CgroupHandle::Unified),
            CgroupMode::Legacy | CgroupMode::Hybrid => {
                self.load_legacy(pid).map(CgroupHandle::Legacy)
            }
            CgroupMode::Unavailable => Err(ShimError::Cgroup {
                pid,
                message: format!("no cgroup filesystem at {}", self.root.display()),
            }),
        }
    }
}
