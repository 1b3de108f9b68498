//! Turns a create request into a ready-to-start [`Container`].
//!
//! Construction reads the bundle configuration, assembles the root
//! filesystem, decides between sandbox and guest launch, and wraps the init
//! process. Mounts applied along the way are undone if any later step fails.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::SyncSender;

use wasmshim_common::config::RuntimeConfig;
use wasmshim_common::constants;
use wasmshim_common::error::{Result, ShimError};
use wasmshim_common::types::{CreateTaskRequest, Exit, Mount};
use wasmshim_core::cgroup::{CgroupHierarchy, CgroupResolver};
use wasmshim_core::filesystem::mount::{Mounter, SystemMounter};

use crate::bundle::{self, BundleSpec};
use crate::container::Container;
use crate::launcher::LaunchSpec;
use crate::process::WasmProcess;

/// Builds containers from bundles.
pub struct ContainerFactory {
    config: RuntimeConfig,
    mounter: Arc<dyn Mounter>,
    cgroups: Arc<dyn CgroupResolver>,
}

impl std::fmt::Debug for ContainerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Unmounts a rootfs on drop unless disarmed.
struct MountGuard<'a> {
    mounter: &'a dyn Mounter,
    target: Option<PathBuf>,
}

impl<'a> MountGuard<'a> {
    const fn new(mounter: &'a dyn Mounter) -> Self {
        Self {
            mounter,
            target: None,
        }
    }

    fn arm(&mut self, target: &Path) {
        self.target = Some(target.to_path_buf());
    }

    fn disarm(mut self) {
        self.target = None;
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            tracing::debug!(target = %target.display(), "unwinding rootfs mounts");
            if let Err(e) = self.mounter.unmount_all(&target) {
                tracing::warn!(target = %target.display(), error = %e, "rootfs unmount failed");
            }
        }
    }
}

impl ContainerFactory {
    /// Creates a factory using the host mounter and cgroup hierarchy
    /// described by `config`.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let cgroups = CgroupHierarchy::new(&config.cgroup_root, &config.proc_root);
        Self {
            config,
            mounter: Arc::new(SystemMounter),
            cgroups: Arc::new(cgroups),
        }
    }

    /// Replaces the mounter.
    #[must_use]
    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    /// Replaces the cgroup resolver handed to created containers.
    #[must_use]
    pub fn with_cgroup_resolver(mut self, cgroups: Arc<dyn CgroupResolver>) -> Self {
        self.cgroups = cgroups;
        self
    }

    /// Returns the runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Creates a container for `request`. The init process publishes its
    /// exit on `exit_tx`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle configuration is unreadable or has no
    /// process, a rootfs mount fails, no root filesystem can be determined,
    /// or the environment is malformed. Mounts applied before the failure
    /// are removed.
    pub fn create(&self, request: &CreateTaskRequest, exit_tx: SyncSender<Exit>) -> Result<Container> {
        let spec = BundleSpec::load(&request.bundle)?;
        let _ = spec.process()?;

        let mut guard = MountGuard::new(self.mounter.as_ref());
        let rootfs = self.prepare_rootfs(request, &spec, &mut guard)?;
        let launch = self.launch_spec(request, &spec, &rootfs)?;

        tracing::info!(
            id = %request.id,
            bundle = %request.bundle.display(),
            rootfs = %rootfs.display(),
            sandbox = launch.is_sandbox,
            "container created"
        );

        let init = Arc::new(WasmProcess::new(request.id.clone(), launch, exit_tx));
        let container = Container::new(
            request.id.clone(),
            request.bundle.clone(),
            rootfs,
            init,
            Arc::clone(&self.cgroups),
        );
        guard.disarm();
        Ok(container)
    }

    /// Resolves the launch parameters of the init process without mounting
    /// anything. The rootfs is computed as [`ContainerFactory::create`]
    /// would, but an assembled rootfs is only named, not built.
    ///
    /// # Errors
    ///
    /// Same as [`ContainerFactory::create`], minus mount failures.
    pub fn inspect(&self, request: &CreateTaskRequest) -> Result<LaunchSpec> {
        let spec = BundleSpec::load(&request.bundle)?;
        let rootfs = if request.rootfs.iter().any(|m| !m.is_bind()) {
            request.bundle.join(constants::BUNDLE_ROOTFS_DIR)
        } else {
            select_root(&request.rootfs, &spec, &request.bundle)?
        };
        self.launch_spec(request, &spec, &rootfs)
    }

    /// Unmounts a rootfs this factory assembled for `container`. Containers
    /// rooted elsewhere are left alone.
    ///
    /// # Errors
    ///
    /// Returns the unmount error.
    pub fn cleanup(&self, container: &Container) -> Result<()> {
        let assembled = container.bundle().join(constants::BUNDLE_ROOTFS_DIR);
        if container.rootfs() != assembled {
            return Ok(());
        }
        tracing::debug!(id = %container.id(), rootfs = %assembled.display(), "releasing rootfs");
        self.mounter.unmount_all(&assembled)
    }

    fn prepare_rootfs(
        &self,
        request: &CreateTaskRequest,
        spec: &BundleSpec,
        guard: &mut MountGuard<'_>,
    ) -> Result<PathBuf> {
        if !request.rootfs.iter().any(|m| !m.is_bind()) {
            return select_root(&request.rootfs, spec, &request.bundle);
        }

        let target = request.bundle.join(constants::BUNDLE_ROOTFS_DIR);
        match DirBuilder::new().mode(constants::ROOTFS_DIR_MODE).create(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(ShimError::Io { path: target, source: e }),
        }

        guard.arm(&target);
        for mount in &request.rootfs {
            self.mounter.mount(mount, &target).inspect_err(|e| {
                tracing::error!(id = %request.id, kind = %mount.kind, source = %mount.source, error = %e, "rootfs mount failed");
            })?;
        }
        Ok(target)
    }

    /// Builds the launch spec of the init process rooted at `rootfs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle has no process or a malformed
    /// environment entry.
    pub fn launch_spec(
        &self,
        request: &CreateTaskRequest,
        spec: &BundleSpec,
        rootfs: &Path,
    ) -> Result<LaunchSpec> {
        let process = spec.process()?;
        let mut argv = process.args.clone();
        if let Some(first) = argv.first_mut() {
            *first = rootfs
                .join(first.trim_start_matches('/'))
                .to_string_lossy()
                .into_owned();
        }
        let mut stdio = request.stdio.clone();
        stdio.terminal |= process.terminal;

        Ok(LaunchSpec {
            argv,
            env: bundle::parse_env(&process.env)?,
            rootfs: rootfs.to_path_buf(),
            is_sandbox: spec.is_sandbox(),
            engine: self.config.resolve_engine(),
            stdio,
        })
    }
}

/// Picks the rootfs when nothing needs assembling: the first mount's
/// source, then the bundle's declared root.
fn select_root(mounts: &[Mount], spec: &BundleSpec, bundle: &Path) -> Result<PathBuf> {
    mounts
        .first()
        .map(|m| PathBuf::from(&m.source))
        .or_else(|| spec.root_path(bundle))
        .ok_or_else(|| ShimError::invalid_argument("no root provided"))
}
