//! Filesystem management for container root filesystems.
//!
//! Provides mount option parsing and the mount/unmount primitives used to
//! assemble a rootfs from the mounts supplied with a create request.

pub mod mount;
