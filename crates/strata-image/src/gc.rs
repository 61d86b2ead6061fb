//! Two-phase garbage collection of layer volumes.
//!
//! Marking moves every volume no image depends on out of the live
//! namespace, so new clones can no longer find it. Collecting destroys the
//! marked volumes. The two phases can run at different times; only marking
//! has to be serialized against in-flight clones.

use std::collections::HashSet;
use std::sync::Arc;

use strata_common::context::RequestContext;
use strata_common::error::{CollectFailure, Result, StrataError};
use strata_common::types::ImageLocator;
use strata_store::dependency::DependencyManager;
use strata_store::lock::StoreLock;
use strata_store::volume::VolumeDriver;

const IMAGE_PREFIX: &str = "image:";
const BASE_IMAGE_PREFIX: &str = "baseimage:";

/// Outcome of a collect phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectSummary {
    /// Volumes destroyed, in the order they were destroyed.
    pub destroyed: Vec<String>,
}

/// Marks and collects volumes that no consumer depends on.
pub struct GarbageCollector {
    volume_driver: Arc<dyn VolumeDriver>,
    dependency_manager: Arc<dyn DependencyManager>,
    lock: Option<StoreLock>,
}

/// Normalizes a keep entry so `OCI:///x` and `oci:///x` match.
fn normalize_locator(image: &str) -> String {
    ImageLocator::parse(image).map_or_else(|_| image.to_string(), |l| l.to_string())
}

impl GarbageCollector {
    /// Creates a collector over the volume store and the dependency graph.
    #[must_use]
    pub fn new(
        volume_driver: Arc<dyn VolumeDriver>,
        dependency_manager: Arc<dyn DependencyManager>,
    ) -> Self {
        Self {
            volume_driver,
            dependency_manager,
            lock: None,
        }
    }

    /// Holds `lock` exclusively while marking.
    #[must_use]
    pub fn with_lock(mut self, lock: StoreLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Returns the live volumes that marking would move out.
    ///
    /// Volumes of `image:` consumers are always in use. Volumes of a
    /// `baseimage:` consumer are in use only if its locator is in `keep`.
    /// Consumers of any other kind keep their volumes.
    ///
    /// # Errors
    ///
    /// Returns an error if the volumes or the dependency graph cannot be read.
    pub fn unused_volumes(&self, keep: &[String]) -> Result<Vec<String>> {
        let keep: HashSet<String> = keep.iter().map(|k| normalize_locator(k)).collect();

        let mut used = HashSet::new();
        for consumer in self.dependency_manager.consumers()? {
            let protects = consumer
                .strip_prefix(BASE_IMAGE_PREFIX)
                .is_none_or(|locator| keep.contains(&normalize_locator(locator)));
            if !protects {
                tracing::debug!(consumer = %consumer, "base image not kept");
                continue;
            }
            let resources = match self.dependency_manager.dependencies(&consumer) {
                Ok(resources) => resources,
                // Deregistered between listing and reading.
                Err(StrataError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if !consumer.starts_with(IMAGE_PREFIX) && !consumer.starts_with(BASE_IMAGE_PREFIX) {
                tracing::debug!(consumer = %consumer, "unknown consumer kind, keeping its volumes");
            }
            used.extend(resources);
        }

        Ok(self
            .volume_driver
            .volumes()?
            .into_iter()
            .filter(|volume| !used.contains(volume))
            .collect())
    }

    /// Moves every unused volume out of the live namespace.
    ///
    /// A volume that fails to move is logged and skipped; it stays live and
    /// is retried by the next run. Returns the IDs actually marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the store cannot be
    /// read.
    pub fn mark_unused(&self, ctx: &RequestContext, keep: &[String]) -> Result<Vec<String>> {
        let span = ctx.span("marking-unused");
        let _enter = span.enter();
        let _guard = self.lock.as_ref().map(StoreLock::exclusive).transpose()?;

        let unused = self.unused_volumes(keep)?;
        let mut marked = Vec::with_capacity(unused.len());
        for volume in unused {
            match self.volume_driver.mark_for_cleanup(&volume) {
                Ok(()) => {
                    tracing::debug!(volume = %volume, "volume marked for cleanup");
                    marked.push(volume);
                }
                Err(e) => tracing::warn!(volume = %volume, error = %e, "failed to mark volume"),
            }
        }
        tracing::info!(count = marked.len(), "marked unused volumes");
        Ok(marked)
    }

    /// Destroys every marked volume.
    ///
    /// Runs without the store lock: it only ever removes marked volumes, so
    /// a live volume recreated under a marked ID is left alone.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Collect` listing every volume that could not be
    /// destroyed; the others are destroyed regardless.
    pub fn collect(&self, ctx: &RequestContext) -> Result<CollectSummary> {
        let span = ctx.span("collecting");
        let _enter = span.enter();

        let mut summary = CollectSummary::default();
        let mut failures = Vec::new();
        for volume in self.volume_driver.marked_volumes()? {
            match self.volume_driver.destroy_marked(&volume) {
                Ok(true) => {
                    tracing::debug!(volume = %volume, "volume destroyed");
                    summary.destroyed.push(volume);
                }
                Ok(false) => {
                    tracing::debug!(volume = %volume, "volume already collected");
                }
                Err(e) => {
                    tracing::error!(volume = %volume, error = %e, "failed to destroy volume");
                    failures.push(CollectFailure {
                        volume_id: volume,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            destroyed = summary.destroyed.len(),
            failed = failures.len(),
            "collect finished"
        );
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(StrataError::Collect { failures })
        }
    }
}
