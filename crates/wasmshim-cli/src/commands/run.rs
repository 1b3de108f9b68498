//! `wasmshim run` — Create, start, and wait on a bundle.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use anyhow::Context;
use clap::Args;
use wasmshim_common::config::RuntimeConfig;
use wasmshim_common::types::{
    self, CreateTaskRequest, DeleteRequest, KillRequest, Mount, ProcessState, StartRequest, Stdio,
};
use wasmshim_runtime::container::Container;
use wasmshim_runtime::factory::ContainerFactory;

use crate::output;

const SIGTERM: u32 = 15;
const SIGKILL: u32 = 9;

/// Task selection shared by commands that resolve a bundle.
#[derive(Args, Debug)]
pub struct TaskArgs {
    /// Bundle directory holding `config.json`.
    pub bundle: PathBuf,

    /// Task identifier; generated when omitted.
    #[arg(long)]
    pub id: Option<String>,

    /// Directory used as the root filesystem (bind).
    #[arg(long, conflicts_with = "mounts")]
    pub rootfs: Option<String>,

    /// Root filesystem component as `TYPE:SOURCE[:OPT,OPT...]`, in order.
    #[arg(long = "mount", value_name = "MOUNT", value_parser = parse_mount)]
    pub mounts: Vec<Mount>,

    /// File or FIFO connected to the task's stdin.
    #[arg(long)]
    pub stdin: Option<PathBuf>,

    /// File or FIFO receiving the task's stdout.
    #[arg(long)]
    pub stdout: Option<PathBuf>,

    /// File or FIFO receiving the task's stderr.
    #[arg(long)]
    pub stderr: Option<PathBuf>,
}

impl TaskArgs {
    /// Builds the create request for these arguments.
    pub fn request(&self) -> CreateTaskRequest {
        let rootfs = self.rootfs.as_ref().map_or_else(
            || self.mounts.clone(),
            |source| {
                vec![Mount {
                    kind: "bind".into(),
                    source: source.clone(),
                    options: vec!["rbind".into()],
                }]
            },
        );
        CreateTaskRequest {
            id: self
                .id
                .clone()
                .unwrap_or_else(types::generate_task_id),
            bundle: self.bundle.clone(),
            rootfs,
            stdio: Stdio {
                stdin: self.stdin.clone(),
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
                terminal: false,
            },
        }
    }
}

/// Parses `TYPE:SOURCE[:OPT,OPT...]`.
fn parse_mount(raw: &str) -> Result<Mount, String> {
    let mut parts = raw.splitn(3, ':');
    let kind = parts.next().unwrap_or_default();
    let source = parts.next().unwrap_or_default();
    if kind.is_empty() || source.is_empty() {
        return Err(format!("expected TYPE:SOURCE[:OPTIONS], got {raw:?}"));
    }
    let options = parts
        .next()
        .map(|opts| {
            opts.split(',')
                .filter(|o| !o.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(Mount {
        kind: kind.to_string(),
        source: source.to_string(),
        options,
    })
}

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Task selection.
    #[command(flatten)]
    pub task: TaskArgs,
}

/// Executes the `run` command.
///
/// The first interrupt forwards `SIGTERM` to the task, the second `SIGKILL`.
/// The process exits with the task's exit status.
///
/// # Errors
///
/// Returns an error if the task cannot be created or started.
pub fn execute(args: RunArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let request = args.task.request();
    let (tx, exits) = mpsc::sync_channel(config.exit_channel_capacity);
    let factory = ContainerFactory::new(config);
    let container = Arc::new(
        factory
            .create(&request, tx)
            .with_context(|| format!("creating task {}", request.id))?,
    );

    if let Err(e) = container.start(&StartRequest::default()) {
        abort_started(&container);
        release(&factory, &container);
        return Err(e).with_context(|| format!("starting task {}", request.id));
    }
    tracing::info!(id = %request.id, pid = container.pid(), "task running");

    forward_interrupts(&container)?;

    let exit = exits.recv().context("exit channel closed before the task exited")?;
    eprintln!("{}", output::exit_line(&request.id, exit.pid, exit.status));

    if let Err(e) = container.delete(&DeleteRequest::default()) {
        tracing::warn!(id = %request.id, error = %e, "delete failed");
    }
    release(&factory, &container);
    std::process::exit(output::process_exit_code(exit.status));
}

/// Kills a process left running by a start that failed after the spawn.
fn abort_started(container: &Container) {
    let Ok(init) = container.process("") else {
        return;
    };
    if matches!(init.status(), Ok(ProcessState::Running)) {
        tracing::warn!(pid = init.pid(), "killing task after failed start");
        let _ = container.kill(&KillRequest {
            exec_id: String::new(),
            signal: SIGKILL,
            all: true,
        });
        init.wait();
    }
}

fn release(factory: &ContainerFactory, container: &Container) {
    if let Err(e) = factory.cleanup(container) {
        tracing::warn!(id = %container.id(), error = %e, "rootfs cleanup failed");
    }
}

fn forward_interrupts(container: &Arc<Container>) -> anyhow::Result<()> {
    let container = Arc::clone(container);
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        let signal = if interrupted.swap(true, Ordering::SeqCst) {
            SIGKILL
        } else {
            SIGTERM
        };
        tracing::info!(id = %container.id(), signal, "forwarding interrupt");
        if let Err(e) = container.kill(&KillRequest {
            exec_id: String::new(),
            signal,
            all: true,
        }) {
            tracing::warn!(id = %container.id(), error = %e, "failed to signal task");
        }
    })
    .context("failed to set Ctrl+C handler")
}
