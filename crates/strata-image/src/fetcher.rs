//! Image sources: layer digest chains, configs and blob streams.

use std::io::Read;

use strata_common::error::Result;
use strata_common::types::{ImageConfig, ImageLocator, LayerDigest};

/// A readable blob together with its size on the source.
pub type BlobStream = (Box<dyn Read + Send>, u64);

/// Resolves an image into its layers and configuration.
pub trait Fetcher: Send + Sync {
    /// Returns the layer digests of the image, base first, and its config.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be resolved.
    fn layers_digest(&self, locator: &ImageLocator) -> Result<(Vec<LayerDigest>, ImageConfig)>;

    /// Opens a streamer for the blobs of the image.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be opened.
    fn streamer(&self, locator: &ImageLocator) -> Result<Box<dyn Streamer>>;
}

/// Streams the blobs of one image.
pub trait Streamer: Send {
    /// Opens the uncompressed content of `blob_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is missing or unreadable.
    fn stream(&self, blob_id: &str) -> Result<BlobStream>;
}
