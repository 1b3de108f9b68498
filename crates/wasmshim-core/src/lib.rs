//! # wasmshim-core
//!
//! Low-level Linux primitives for the wasmshim runtime.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups**: hierarchy mode detection and per-pid discovery for both
//!   the legacy per-subsystem layout and the unified hierarchy.
//! - **Filesystem**: mount option parsing and the [`filesystem::mount::Mounter`]
//!   seam used to assemble container root filesystems.
//! - **Signals**: delivery of numeric signals to a process or its group.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod signal;
