//! CLI command definitions and dispatch.

pub mod inspect;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use wasmshim_common::config::RuntimeConfig;

/// wasmshim — WebAssembly task runner built on the shim lifecycle core.
#[derive(Parser, Debug)]
#[command(name = "wasmshim", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Runtime configuration file (JSON).
    #[arg(long, global = true, env = "WASMSHIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Engine executable for guest-mode tasks; overrides the config file.
    #[arg(long, global = true, env = "WASMSHIM_ENGINE")]
    pub engine: Option<String>,
}

impl Cli {
    /// Loads the runtime configuration and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(engine) = &self.engine {
            config.engine.clone_from(engine);
        }
        Ok(config)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a task from a bundle, start it, and wait for it to exit.
    Run(run::RunArgs),
    /// Print the resolved launch of a bundle without running it.
    Inspect(inspect::InspectArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.runtime_config()?;
    match cli.command {
        Command::Run(args) => run::execute(args, config),
        Command::Inspect(args) => inspect::execute(&args, config),
    }
}
