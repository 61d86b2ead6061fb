//! `strata create`: materialize an image into a new bundle.

use clap::Args;
use strata_common::config::StrataConfig;
use strata_common::context::RequestContext;
use strata_common::types::IdMapping;
use strata_image::creator::CreateSpec;

use crate::store::Store;

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Image locator, e.g. `oci:///var/images/busybox`.
    pub image: String,

    /// ID of the new image.
    pub id: String,

    /// UID mapping `NAMESPACE_ID:HOST_ID:SIZE`; repeatable.
    #[arg(long = "uid-mapping")]
    pub uid_mappings: Vec<IdMapping>,

    /// GID mapping `NAMESPACE_ID:HOST_ID:SIZE`; repeatable.
    #[arg(long = "gid-mapping")]
    pub gid_mappings: Vec<IdMapping>,

    /// Disk limit in bytes for the unpacked layers.
    #[arg(long)]
    pub disk_limit_size_bytes: Option<u64>,

    /// Do not count the base image against the disk limit.
    #[arg(long)]
    pub exclude_image_from_quota: bool,
}

/// Executes the `create` command and prints the bundle path.
///
/// Mappings given on the command line replace the configured ones.
///
/// # Errors
///
/// Returns an error if the image cannot be created.
pub fn execute(args: CreateArgs, config: &StrataConfig) -> anyhow::Result<()> {
    let uid_mappings = if args.uid_mappings.is_empty() {
        config.parsed_uid_mappings()?
    } else {
        args.uid_mappings
    };
    let gid_mappings = if args.gid_mappings.is_empty() {
        config.parsed_gid_mappings()?
    } else {
        args.gid_mappings
    };
    let spec = CreateSpec {
        id: args.id,
        image: args.image,
        uid_mappings,
        gid_mappings,
        disk_limit: args.disk_limit_size_bytes.or(config.disk_limit_size_bytes),
        exclude_image_from_quota: args.exclude_image_from_quota || config.exclude_image_from_quota,
    };

    let store = Store::open(&config.store)?;
    let bundle = store.creator().create(&RequestContext::new(), &spec)?;
    println!("{}", bundle.path().display());
    Ok(())
}
