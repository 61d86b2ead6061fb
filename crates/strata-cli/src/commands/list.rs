//! `strata list`: list the images of the store.

use clap::Args;
use strata_common::config::StrataConfig;
use strata_store::bundle::Bundler;

use crate::output::print_json;
use crate::store::Store;

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print JSON instead of one ID per line.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `list` command.
///
/// # Errors
///
/// Returns an error if the bundles cannot be listed.
pub fn execute(args: &ListArgs, config: &StrataConfig) -> anyhow::Result<()> {
    let store = Store::open(&config.store)?;
    let ids = store.bundler().ids()?;
    if args.json {
        return print_json(&ids);
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}
