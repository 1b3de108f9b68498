//! Unified error types for the wasmshim workspace.
//!
//! Every fallible operation in the library crates returns [`ShimError`].
//! Callers that need to map failures onto a task-service status code use
//! [`ShimError::kind`], which collapses the detailed variants into the
//! canonical [`ErrorKind`] categories.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ShimError {
    /// An I/O operation on a path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A request or bundle field is malformed or missing.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid input.
        message: String,
    },

    /// An operation was attempted before its required setup.
    #[error("failed precondition: {message}")]
    FailedPrecondition {
        /// Description of the violated precondition.
        message: String,
    },

    /// `start` was called on a process that already owns an OS handle.
    #[error("process {id} is already running")]
    AlreadyRunning {
        /// Identifier of the process.
        id: String,
    },

    /// A signal was requested for a process that was never started.
    #[error("process {id} not started")]
    NotStarted {
        /// Identifier of the process.
        id: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The lifecycle operation is not supported by this runtime.
    #[error("{operation} not implemented")]
    NotImplemented {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// A system call (spawn, wait, signal, mount) failed.
    #[error("{operation} failed: {source}")]
    System {
        /// Short name of the failing operation.
        operation: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// Cgroup discovery for a process failed.
    #[error("cgroup lookup for pid {pid} failed: {message}")]
    Cgroup {
        /// Process whose cgroup was being resolved.
        pid: u32,
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl ShimError {
    /// Builds an [`ShimError::InvalidArgument`] from any message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Builds a [`ShimError::System`] for the named operation.
    pub fn system(operation: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::System {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Returns the canonical category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::InvalidArgument { .. } | Self::Serialization { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::FailedPrecondition { .. }
            | Self::AlreadyRunning { .. }
            | Self::NotStarted { .. } => ErrorKind::FailedPrecondition,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotImplemented { .. } => ErrorKind::NotImplemented,
            Self::System { .. } | Self::Cgroup { .. } => ErrorKind::System,
        }
    }
}

/// Canonical error categories exposed to the task-service layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing input.
    InvalidArgument,
    /// Operation attempted in the wrong lifecycle state.
    FailedPrecondition,
    /// Unknown identifier.
    NotFound,
    /// Unsupported lifecycle operation.
    NotImplemented,
    /// File open/close failure.
    Io,
    /// Wrapped OS error from spawn, wait, signal, mount, or cgroup access.
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "invalid argument",
            Self::FailedPrecondition => "failed precondition",
            Self::NotFound => "not found",
            Self::NotImplemented => "not implemented",
            Self::Io => "i/o",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ShimError>;
