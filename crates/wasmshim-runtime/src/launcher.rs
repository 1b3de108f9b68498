//! Builds the external command that embodies a task process.
//!
//! Two launch modes exist:
//! - **Sandbox**: `argv[0]` is executed directly with the remaining
//!   arguments.
//! - **Guest**: the configured engine is executed with a root remap flag,
//!   one env flag per variable, and then the workload argv. Engines parse
//!   flags positionally up to the first non-flag token, so that order is
//!   fixed.

use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio as ChildStdio};

use serde::Serialize;
use wasmshim_common::constants;
use wasmshim_common::error::{Result, ShimError};
use wasmshim_common::types::Stdio;

/// Everything needed to launch one process. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    /// Workload command and arguments.
    pub argv: Vec<String>,
    /// Workload environment, in declaration order.
    pub env: Vec<(String, String)>,
    /// Host path presented to the workload as `/`.
    pub rootfs: PathBuf,
    /// Execute `argv[0]` directly instead of through the engine.
    pub is_sandbox: bool,
    /// Engine executable used in guest mode.
    pub engine: String,
    /// I/O redirection targets.
    pub stdio: Stdio,
}

/// Fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    /// Executable to run.
    pub program: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Variables overlaid on the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Open handles bound to the child's standard streams.
#[derive(Debug, Default)]
pub struct StdioFiles {
    /// Read end handed to the child as stdin.
    pub stdin: Option<File>,
    /// Handed to the child as stdout.
    pub stdout: Option<File>,
    /// Handed to the child as stderr.
    pub stderr: Option<File>,
}

/// Builds the invocation for `spec`.
///
/// # Errors
///
/// Returns [`ShimError::InvalidArgument`] if the argv is empty.
pub fn build(spec: &LaunchSpec) -> Result<Invocation> {
    let Some((program, rest)) = spec.argv.split_first() else {
        return Err(ShimError::invalid_argument("process argv is empty"));
    };

    if spec.is_sandbox {
        return Ok(Invocation {
            program: program.clone(),
            args: rest.to_vec(),
            env: spec.env.clone(),
        });
    }

    Ok(Invocation {
        program: spec.engine.clone(),
        args: guest_args(spec),
        env: Vec::new(),
    })
}

/// Synthesizes the engine argument vector: remap, env flags, then argv.
fn guest_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = Vec::with_capacity(1 + spec.env.len() + spec.argv.len());
    args.push(format!(
        "{}=/:{}",
        constants::MAPDIR_FLAG,
        spec.rootfs.display()
    ));
    args.extend(
        spec.env
            .iter()
            .map(|(key, value)| format!("{}={key}={value}", constants::ENV_FLAG)),
    );
    args.extend(spec.argv.iter().cloned());
    args
}

impl Invocation {
    /// Converts the invocation into a ready-to-spawn command.
    ///
    /// Streams without a handle are connected to `/dev/null`. The child
    /// leads its own process group so a signal can reach everything it
    /// spawns.
    #[must_use]
    pub fn command(&self, files: StdioFiles) -> Command {
        let mut cmd = Command::new(&self.program);
        let _ = cmd
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(files.stdin.map_or_else(ChildStdio::null, ChildStdio::from))
            .stdout(files.stdout.map_or_else(ChildStdio::null, ChildStdio::from))
            .stderr(files.stderr.map_or_else(ChildStdio::null, ChildStdio::from))
            .process_group(0);
        cmd
    }
}
