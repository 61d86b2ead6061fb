//! `strata stats`: disk usage of the store.

use clap::Args;
use strata_common::config::StrataConfig;
use strata_store::stats::collect_stats;

use crate::output::{format_bytes, print_json};
use crate::store::Store;

/// Arguments for the `stats` command.
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,

    /// List every volume.
    #[arg(short, long)]
    pub volumes: bool,
}

/// Executes the `stats` command.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn execute(args: &StatsArgs, config: &StrataConfig) -> anyhow::Result<()> {
    let store = Store::open(&config.store)?;
    let stats = collect_stats(store.root())?;
    if args.json {
        return print_json(&stats);
    }

    println!("{:<10} {:>8} {:>12}", "KIND", "COUNT", "SIZE");
    println!(
        "{:<10} {:>8} {:>12}",
        "volumes",
        stats.volumes.len(),
        format_bytes(stats.volumes_bytes)
    );
    println!(
        "{:<10} {:>8} {:>12}",
        "marked",
        stats.marked_volumes,
        format_bytes(stats.marked_bytes)
    );
    println!(
        "{:<10} {:>8} {:>12}",
        "images",
        stats.images,
        format_bytes(stats.images_bytes)
    );
    println!("{:<10} {:>8} {:>12}", "total", "", format_bytes(stats.total_bytes()));

    if args.volumes {
        println!();
        println!("{:<80} {:>12}", "VOLUME ID", "SIZE");
        for volume in &stats.volumes {
            println!("{:<80} {:>12}", volume.id, format_bytes(volume.bytes));
        }
    }
    Ok(())
}
