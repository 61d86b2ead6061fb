//! Removing materialized images.

use std::sync::Arc;

use strata_common::context::RequestContext;
use strata_common::error::Result;
use strata_common::types::image_consumer;
use strata_store::bundle::Bundler;
use strata_store::dependency::DependencyManager;

/// Destroys bundles and releases the volumes they depended on.
pub struct Deleter {
    bundler: Arc<dyn Bundler>,
    dependency_manager: Arc<dyn DependencyManager>,
}

impl Deleter {
    /// Creates a deleter.
    #[must_use]
    pub fn new(bundler: Arc<dyn Bundler>, dependency_manager: Arc<dyn DependencyManager>) -> Self {
        Self {
            bundler,
            dependency_manager,
        }
    }

    /// Destroys the bundle of `image_id` and deregisters its dependencies.
    ///
    /// Deregistration runs even if the bundle could not be destroyed, so a
    /// half-removed image never pins its volumes. A deregistration failure
    /// is logged and does not change the result.
    ///
    /// # Errors
    ///
    /// Returns the error of destroying the bundle.
    pub fn delete(&self, ctx: &RequestContext, image_id: &str) -> Result<()> {
        let span = ctx.span("deleting");
        let _enter = span.enter();
        tracing::info!(image_id, "deleting image");

        let destroyed = self.bundler.destroy(image_id);
        if let Err(e) = &destroyed {
            tracing::warn!(image_id, error = %e, "failed to destroy bundle");
        }

        let consumer = image_consumer(image_id);
        if let Err(e) = self.dependency_manager.deregister(&consumer) {
            tracing::error!(consumer = %consumer, error = %e, "failed to deregister dependencies");
        }

        if destroyed.is_ok() {
            tracing::info!(image_id, "image deleted");
        }
        destroyed
    }
}
