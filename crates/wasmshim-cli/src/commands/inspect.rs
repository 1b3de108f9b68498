//! `wasmshim inspect` — Print the resolved launch of a bundle.

use clap::Args;
use serde::Serialize;
use wasmshim_common::config::RuntimeConfig;
use wasmshim_runtime::factory::ContainerFactory;
use wasmshim_runtime::launcher::{self, Invocation, LaunchSpec};

use super::run::TaskArgs;

/// Arguments for the `inspect` command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Task selection.
    #[command(flatten)]
    pub task: TaskArgs,
}

#[derive(Serialize)]
struct Report {
    id: String,
    launch: LaunchSpec,
    invocation: Invocation,
}

/// Executes the `inspect` command. Nothing is mounted or spawned.
///
/// # Errors
///
/// Returns an error if the bundle cannot be resolved.
pub fn execute(args: &InspectArgs, config: RuntimeConfig) -> anyhow::Result<()> {
    let request = args.task.request();
    let launch = ContainerFactory::new(config).inspect(&request)?;
    let invocation = launcher::build(&launch)?;
    let report = Report {
        id: request.id,
        launch,
        invocation,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
