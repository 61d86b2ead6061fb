//! Creating images: bundle, clone and dependency registration in one step.

use std::sync::Arc;

use strata_common::context::RequestContext;
use strata_common::error::{Result, StrataError};
use strata_common::types::{IdMapping, ImageLocator, base_image_consumer, image_consumer};
use strata_store::bundle::{Bundle, Bundler, validate_image_id};
use strata_store::dependency::DependencyManager;

use crate::cloner::{CloneSpec, RemoteCloner};

/// Parameters of one create request.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// ID of the new image; names its bundle.
    pub id: String,
    /// Locator of the base image.
    pub image: String,
    /// UID mappings for a user-namespaced rootfs.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings for a user-namespaced rootfs.
    pub gid_mappings: Vec<IdMapping>,
    /// Disk limit in bytes for the unpacked layers.
    pub disk_limit: Option<u64>,
    /// Do not charge the base image against `disk_limit`.
    pub exclude_image_from_quota: bool,
}

impl CreateSpec {
    /// Creates a spec without mappings or quota.
    #[must_use]
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            ..Self::default()
        }
    }
}

/// Materializes images and records what they depend on.
pub struct Creator {
    bundler: Arc<dyn Bundler>,
    cloner: RemoteCloner,
    dependency_manager: Arc<dyn DependencyManager>,
}

impl Creator {
    /// Creates a creator.
    #[must_use]
    pub fn new(
        bundler: Arc<dyn Bundler>,
        cloner: RemoteCloner,
        dependency_manager: Arc<dyn DependencyManager>,
    ) -> Self {
        Self {
            bundler,
            cloner,
            dependency_manager,
        }
    }

    /// Creates the image `spec.id` from `spec.image`.
    ///
    /// The volumes of the image are registered under both the image and its
    /// base image before the clone lease is released. On failure the new
    /// bundle is destroyed again.
    ///
    /// # Errors
    ///
    /// - `InvalidId` or `InvalidLocator` for malformed input.
    /// - `AlreadyExists` if the ID is taken.
    /// - Any error of the clone or of registering the dependencies.
    pub fn create(&self, ctx: &RequestContext, spec: &CreateSpec) -> Result<Bundle> {
        let span = ctx.span("creating");
        let _enter = span.enter();
        tracing::info!(id = %spec.id, image = %spec.image, "creating image");

        validate_image_id(&spec.id)?;
        let locator = ImageLocator::parse(&spec.image)?;
        if self.bundler.exists(&spec.id)? {
            return Err(StrataError::AlreadyExists {
                kind: "image",
                id: spec.id.clone(),
            });
        }

        let bundle = self.bundler.create(&spec.id)?;
        let clone_spec = CloneSpec {
            image: spec.image.clone(),
            bundle: bundle.clone(),
            uid_mappings: spec.uid_mappings.clone(),
            gid_mappings: spec.gid_mappings.clone(),
            disk_limit: spec.disk_limit,
            exclude_image_from_quota: spec.exclude_image_from_quota,
        };

        let lease = match self.cloner.clone_image(ctx, &clone_spec) {
            Ok(lease) => lease,
            Err(e) => {
                self.discard(&spec.id);
                return Err(e);
            }
        };

        let image = image_consumer(&spec.id);
        let registered = self
            .dependency_manager
            .register(&image, lease.volume_ids())
            .and_then(|()| {
                self.dependency_manager
                    .register(&base_image_consumer(&locator.to_string()), lease.volume_ids())
            });
        if let Err(e) = registered {
            if let Err(dereg) = self.dependency_manager.deregister(&image) {
                tracing::error!(consumer = %image, error = %dereg, "failed to deregister dependencies");
            }
            self.discard(&spec.id);
            return Err(e);
        }
        drop(lease);

        tracing::info!(id = %spec.id, rootfs = %bundle.rootfs_path().display(), "image created");
        Ok(bundle)
    }

    fn discard(&self, id: &str) {
        if let Err(e) = self.bundler.destroy(id) {
            tracing::error!(id, error = %e, "failed to destroy partial bundle");
        }
    }
}
