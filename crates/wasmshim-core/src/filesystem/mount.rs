//! Mount utilities for assembling container root filesystems.
//!
//! Rootfs components arrive as `(type, source, options)` triples. Options
//! that name a kernel mount flag are folded into [`nix::mount::MsFlags`];
//! everything else is passed to the filesystem as comma-joined data.

use std::path::Path;

use wasmshim_common::error::Result;
use wasmshim_common::types::Mount;

/// Attaches and detaches filesystems at a target directory.
///
/// Several mounts may be stacked on the same target; [`Mounter::unmount_all`]
/// must remove every one of them.
pub trait Mounter: Send + Sync {
    /// Mounts `mount` on `target`.
    ///
    /// # Errors
    ///
    /// Returns the underlying mount error.
    fn mount(&self, mount: &Mount, target: &Path) -> Result<()>;

    /// Unmounts everything stacked on `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if an unmount fails for a reason other than the
    /// target no longer being a mount point.
    fn unmount_all(&self, target: &Path) -> Result<()>;
}

#[cfg(target_os = "linux")]
pub use linux::{MountOptions, SystemMounter, parse_options};

#[cfg(target_os = "linux")]
mod linux {
    use std::path::Path;

    use nix::errno::Errno;
    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use wasmshim_common::error::{Result, ShimError};
    use wasmshim_common::types::Mount;

    use super::Mounter;

    /// Kernel flags and filesystem data derived from option strings.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MountOptions {
        /// Flags passed to `mount(2)`.
        pub flags: MsFlags,
        /// Filesystem-specific options, in input order.
        pub data: Vec<String>,
    }

    impl MountOptions {
        /// Returns the comma-joined data string, if any.
        #[must_use]
        pub fn data_string(&self) -> Option<String> {
            (!self.data.is_empty()).then(|| self.data.join(","))
        }
    }

    /// Maps an option to `(clear, flag)`; `clear` removes the flag instead.
    fn flag_for(option: &str) -> Option<(bool, MsFlags)> {
        let entry = match option {
            "async" => (true, MsFlags::MS_SYNCHRONOUS),
            "atime" => (true, MsFlags::MS_NOATIME),
            "bind" => (false, MsFlags::MS_BIND),
            "defaults" => (false, MsFlags::empty()),
            "dev" => (true, MsFlags::MS_NODEV),
            "diratime" => (true, MsFlags::MS_NODIRATIME),
            "dirsync" => (false, MsFlags::MS_DIRSYNC),
            "exec" => (true, MsFlags::MS_NOEXEC),
            "noatime" => (false, MsFlags::MS_NOATIME),
            "nodev" => (false, MsFlags::MS_NODEV),
            "nodiratime" => (false, MsFlags::MS_NODIRATIME),
            "noexec" => (false, MsFlags::MS_NOEXEC),
            "norelatime" => (true, MsFlags::MS_RELATIME),
            "nostrictatime" => (true, MsFlags::MS_STRICTATIME),
            "nosuid" => (false, MsFlags::MS_NOSUID),
            "rbind" => (false, MsFlags::MS_BIND.union(MsFlags::MS_REC)),
            "relatime" => (false, MsFlags::MS_RELATIME),
            "remount" => (false, MsFlags::MS_REMOUNT),
            "ro" => (false, MsFlags::MS_RDONLY),
            "rw" => (true, MsFlags::MS_RDONLY),
            "strictatime" => (false, MsFlags::MS_STRICTATIME),
            "suid" => (true, MsFlags::MS_NOSUID),
            "sync" => (false, MsFlags::MS_SYNCHRONOUS),
            _ => return None,
        };
        Some(entry)
    }

    /// Splits option strings into kernel flags and filesystem data.
    #[must_use]
    pub fn parse_options(options: &[String]) -> MountOptions {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for option in options {
            match flag_for(option) {
                Some((true, flag)) => flags.remove(flag),
                Some((false, flag)) => flags.insert(flag),
                None => data.push(option.clone()),
            }
        }
        MountOptions { flags, data }
    }

    /// Mounter backed by `mount(2)` and `umount2(2)`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemMounter;

    impl Mounter for SystemMounter {
        fn mount(&self, m: &Mount, target: &Path) -> Result<()> {
            let options = parse_options(&m.options);
            let data = options.data_string();
            mount(
                Some(m.source.as_str()),
                target,
                Some(m.kind.as_str()),
                options.flags,
                data.as_deref(),
            )
            .map_err(|e| ShimError::system(format!("mount {} on {}", m.kind, target.display()), e))?;

            // The kernel ignores MS_RDONLY on the initial bind; apply it by remounting.
            let bind_ro = MsFlags::MS_BIND | MsFlags::MS_RDONLY;
            if options.flags.contains(bind_ro) {
                mount(
                    None::<&str>,
                    target,
                    None::<&str>,
                    options.flags | MsFlags::MS_REMOUNT,
                    None::<&str>,
                )
                .map_err(|e| ShimError::system(format!("remount {} read-only", target.display()), e))?;
            }
            tracing::debug!(kind = %m.kind, source = %m.source, target = %target.display(), "mounted");
            Ok(())
        }

        fn unmount_all(&self, target: &Path) -> Result<()> {
            loop {
                match umount2(target, MntFlags::MNT_DETACH) {
                    Ok(()) => tracing::debug!(target = %target.display(), "unmounted"),
                    Err(Errno::EINVAL | Errno::ENOENT) => return Ok(()),
                    Err(e) => {
                        return Err(ShimError::system(
                            format!("unmount {}", target.display()),
                            e,
                        ));
                    }
                }
            }
        }
    }

}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

#[cfg(not(target_os = "linux"))]
impl Mounter for SystemMounter {
    fn mount(&self, _mount: &Mount, _target: &Path) -> Result<()> {
        Err(wasmshim_common::error::ShimError::FailedPrecondition {
            message: "Linux required for rootfs mounts".into(),
        })
    }

    fn unmount_all(&self, _target: &Path) -> Result<()> {
        Err(wasmshim_common::error::ShimError::FailedPrecondition {
            message: "Linux required for rootfs mounts".into(),
        })
    }
}
