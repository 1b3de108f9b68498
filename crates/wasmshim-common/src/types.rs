//! Domain types used across the wasmshim workspace.
//!
//! The request structs mirror the already-decoded task-service messages the
//! shim receives; the transport that produces them lives outside this
//! workspace.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Generates a random task identifier.
#[must_use]
pub fn generate_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Process has been created but not yet started.
    Created,
    /// The OS process has been spawned and has not exited.
    Running,
    /// The OS process has exited and its status was recorded.
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Exit notification published once per started process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    /// OS process id of the exited process.
    pub pid: u32,
    /// Recorded exit status.
    pub status: i32,
}

/// One component of a container root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type (`bind`, `overlay`, `tmpfs`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Mount source.
    pub source: String,
    /// Raw mount options (`ro`, `lowerdir=...`).
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// Returns whether this mount is a bind mount.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.kind == "bind"
    }
}

/// Standard I/O redirection targets of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stdio {
    /// Path opened read-only and handed to the process as stdin.
    pub stdin: Option<PathBuf>,
    /// Path opened write-only and handed to the process as stdout.
    pub stdout: Option<PathBuf>,
    /// Path opened write-only and handed to the process as stderr.
    pub stderr: Option<PathBuf>,
    /// Whether a terminal was requested.
    #[serde(default)]
    pub terminal: bool,
}

impl Stdio {
    /// Returns whether no stream is redirected.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

/// Terminal dimensions carried by a resize request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinSize {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

/// Request to create a task from an OCI bundle.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    /// Task identifier.
    pub id: String,
    /// Absolute path to the bundle directory.
    pub bundle: PathBuf,
    /// Root filesystem components, applied in order.
    pub rootfs: Vec<Mount>,
    /// I/O redirection for the init process.
    pub stdio: Stdio,
}

/// Request to start the init process (empty `exec_id`) or an exec process.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Exec identifier; empty addresses the init process.
    pub exec_id: String,
}

/// Request to deliver a signal.
#[derive(Debug, Clone, Default)]
pub struct KillRequest {
    /// Exec identifier; empty addresses the init process.
    pub exec_id: String,
    /// Numeric signal.
    pub signal: u32,
    /// Deliver to every process of the task, not just the addressed one.
    pub all: bool,
}

/// Request to delete a process.
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    /// Exec identifier; empty addresses the init process.
    pub exec_id: String,
}

/// Request to resize a process terminal.
#[derive(Debug, Clone, Default)]
pub struct ResizePtyRequest {
    /// Exec identifier; empty addresses the init process.
    pub exec_id: String,
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
}

/// Request to close the I/O of a process.
#[derive(Debug, Clone, Default)]
pub struct CloseIoRequest {
    /// Exec identifier; empty addresses the init process.
    pub exec_id: String,
    /// Set by callers that want the stdin stream closed. The owned stdin
    /// handle is closed either way.
    pub stdin: bool,
}

/// Request to add an exec process to a running task.
#[derive(Debug, Clone, Default)]
pub struct ExecProcessRequest {
    /// Identifier for the new process.
    pub exec_id: String,
    /// I/O redirection for the new process.
    pub stdio: Stdio,
}

/// Request to checkpoint a task.
#[derive(Debug, Clone, Default)]
pub struct CheckpointTaskRequest {
    /// Checkpoint image destination.
    pub path: PathBuf,
}

/// Request to update the resources of a task.
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskRequest {
    /// Raw resource document.
    pub resources: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_state_display_is_lowercase() {
        assert_eq!(ProcessState::Created.to_string(), "created");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn mount_deserializes_type_field() {
        let m: Mount =
            serde_json::from_str(r#"{"type":"overlay","source":"overlay","options":["ro"]}"#)
                .unwrap();
        assert_eq!(m.kind, "overlay");
        assert!(!m.is_bind());
        assert_eq!(m.options, vec!["ro"]);
    }

    #[test]
    fn empty_stdio_is_null() {
        assert!(Stdio::default().is_null());
        let s = Stdio {
            stdout: Some("/tmp/out".into()),
            ..Stdio::default()
        };
        assert!(!s.is_null());
    }

    #[test]
    fn generated_task_ids_are_unique() {
        assert_ne!(generate_task_id(), generate_task_id());
    }
}
