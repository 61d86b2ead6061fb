//! `strata delete`: remove an image.

use clap::Args;
use strata_common::config::StrataConfig;
use strata_common::context::RequestContext;

use crate::store::Store;

/// Arguments for the `delete` command.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// ID of the image to delete.
    pub id: String,
}

/// Executes the `delete` command.
///
/// The volumes of the image stay on disk until the next `clean`.
///
/// # Errors
///
/// Returns an error if the bundle cannot be destroyed.
pub fn execute(args: &DeleteArgs, config: &StrataConfig) -> anyhow::Result<()> {
    let store = Store::open(&config.store)?;
    store.deleter().delete(&RequestContext::new(), &args.id)?;
    println!("Image {} deleted.", args.id);
    Ok(())
}
