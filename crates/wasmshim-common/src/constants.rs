//! System-wide constants and default paths.

/// Engine executable used for guest-mode launches when none is configured.
pub const DEFAULT_ENGINE: &str = "wasmer";

/// Bundle-relative OCI runtime configuration file.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

/// Bundle-relative directory created to host assembled rootfs mounts.
pub const BUNDLE_ROOTFS_DIR: &str = "rootfs";

/// Permissions of the rootfs mount target directory.
pub const ROOTFS_DIR_MODE: u32 = 0o711;

/// Bundle-relative file the init pid is written to after a successful start.
pub const INIT_PID_FILE: &str = "init.pid";

/// Annotation that tells sandbox containers apart from workload containers.
pub const CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";

/// Value of [`CONTAINER_TYPE_ANNOTATION`] marking a sandbox container.
pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";

/// Guest-mode flag binding a guest directory to a host directory.
pub const MAPDIR_FLAG: &str = "--mapdir";

/// Guest-mode flag injecting one environment variable.
pub const ENV_FLAG: &str = "--env";

/// Cgroup filesystem mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Procfs mount point.
pub const PROC_ROOT: &str = "/proc";

/// Exit status recorded when waiting on a process fails.
pub const WAIT_FAILED_STATUS: i32 = -1;

/// Offset added to a terminating signal number to form an exit status.
pub const SIGNAL_EXIT_OFFSET: i32 = 128;

/// Default capacity of the exit-event channel.
pub const DEFAULT_EXIT_CHANNEL_CAPACITY: usize = 32;

/// Binary name for the CLI.
pub const BIN_NAME: &str = "wasmshim";
