//! # strata: layered rootfs store
//!
//! Materializes container images into bundles backed by deduplicated
//! layer volumes, and collects the volumes no image needs any more.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

mod commands;
mod output;
mod store;

use clap::Parser;
use strata_common::config::LogFormat;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    init_tracing(config.log_format);
    commands::execute(cli.command, &config)
}

/// Logs go to stderr so that command output on stdout stays parseable.
fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
