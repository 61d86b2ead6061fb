//! `strata clean`: mark and collect unused volumes.

use clap::Args;
use strata_common::config::StrataConfig;
use strata_common::context::RequestContext;

use crate::store::Store;

/// Arguments for the `clean` command.
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Base image whose volumes survive even without images; repeatable.
    #[arg(long)]
    pub keep: Vec<String>,
}

/// Executes the `clean` command.
///
/// # Errors
///
/// Returns an error if marking fails or any marked volume could not be
/// destroyed.
pub fn execute(args: &CleanArgs, config: &StrataConfig) -> anyhow::Result<()> {
    let store = Store::open(&config.store)?;
    let gc = store.garbage_collector();
    let ctx = RequestContext::new();

    let marked = gc.mark_unused(&ctx, &args.keep)?;
    let summary = gc.collect(&ctx)?;
    println!(
        "Marked {} volume(s), destroyed {} volume(s).",
        marked.len(),
        summary.destroyed.len()
    );
    Ok(())
}
