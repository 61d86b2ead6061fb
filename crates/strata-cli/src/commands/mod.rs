//! CLI command definitions and dispatch.

pub mod clean;
pub mod create;
pub mod delete;
pub mod list;
pub mod stats;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use strata_common::config::{LogFormat, StrataConfig};

/// strata: layered container root filesystems.
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// YAML configuration file.
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store directory; overrides the configuration file.
    #[arg(long, global = true, env = "STRATA_STORE")]
    pub store: Option<PathBuf>,

    /// Log output format; overrides the configuration file.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormatArg>,
}

/// Log output formats accepted on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

impl Cli {
    /// Loads the configuration file, if any, and applies global flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn resolve_config(&self) -> anyhow::Result<StrataConfig> {
        let mut config = match &self.config {
            Some(path) => StrataConfig::load(path)?,
            None => StrataConfig::default(),
        };
        if let Some(store) = &self.store {
            config.store.clone_from(store);
        }
        if let Some(format) = self.log_format {
            config.log_format = format.into();
        }
        Ok(config)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Materialize an image into a new bundle.
    Create(create::CreateArgs),
    /// Delete an image and release its volumes.
    Delete(delete::DeleteArgs),
    /// Destroy volumes no image depends on.
    Clean(clean::CleanArgs),
    /// Show the disk usage of the store.
    Stats(stats::StatsArgs),
    /// List the images of the store.
    List(list::ListArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(command: Command, config: &StrataConfig) -> anyhow::Result<()> {
    match command {
        Command::Create(args) => create::execute(args, config),
        Command::Delete(args) => delete::execute(&args, config),
        Command::Clean(args) => clean::execute(&args, config),
        Command::Stats(args) => stats::execute(&args, config),
        Command::List(args) => list::execute(&args, config),
    }
}
