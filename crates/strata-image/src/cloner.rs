//! Materializing an image into a bundle.
//!
//! Every layer is stored in its own volume, named after its chain ID, and
//! created as a copy of its parent's volume before the layer is applied on
//! top. Volumes are content-addressed: an image sharing its first layers
//! with one cloned earlier reuses those volumes and only fetches the rest.
//! The volume of the topmost layer is finally snapshotted into the bundle.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use strata_common::constants::{NAMESPACED_SUFFIX, UNLIMITED_QUOTA};
use strata_common::context::RequestContext;
use strata_common::error::{Result, StrataError};
use strata_common::types::{IdMapping, ImageConfig, ImageLocator};
use strata_store::bundle::Bundle;
use strata_store::lock::{LockGuard, StoreLock};
use strata_store::volume::{StagedVolume, VolumeDriver};

use crate::fetcher::Fetcher;
use crate::quota::QuotaedReader;
use crate::unpack::{UnpackSpec, Unpacker};

/// Parameters of one clone.
#[derive(Debug, Clone)]
pub struct CloneSpec {
    /// Image locator, `scheme://reference`.
    pub image: String,
    /// Bundle receiving `image.json` and the `rootfs` snapshot.
    pub bundle: Bundle,
    /// UID mappings applied to every unpacked layer.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings applied to every unpacked layer.
    pub gid_mappings: Vec<IdMapping>,
    /// Byte budget shared by all layers unpacked by this clone.
    pub disk_limit: Option<u64>,
    /// Do not charge the image layers against `disk_limit`.
    pub exclude_image_from_quota: bool,
}

impl CloneSpec {
    /// Creates a spec without mappings or quota.
    #[must_use]
    pub const fn new(image: String, bundle: Bundle) -> Self {
        Self {
            image,
            bundle,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            disk_limit: None,
            exclude_image_from_quota: false,
        }
    }

    fn namespaced(&self) -> bool {
        !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()
    }

    fn quota(&self) -> i64 {
        self.disk_limit
            .map_or(UNLIMITED_QUOTA, |limit| i64::try_from(limit).unwrap_or(i64::MAX))
    }
}

/// Returns the volume ID used for `chain_id` under `spec`.
///
/// Layers unpacked with ownership mappings differ on disk from the same
/// layers unpacked without, so they get distinct volumes. The empty parent
/// of a base layer is never suffixed.
#[must_use]
pub fn wrap_volume_id(spec: &CloneSpec, chain_id: &str) -> String {
    if spec.namespaced() && !chain_id.is_empty() {
        format!("{chain_id}{NAMESPACED_SUFFIX}")
    } else {
        chain_id.to_string()
    }
}

/// Proof of a finished clone.
///
/// Holds the volume IDs of the image, base layer first, and keeps garbage
/// collection from marking them until the caller has recorded them as
/// dependencies and dropped the lease.
#[derive(Debug)]
pub struct CloneLease {
    volume_ids: Vec<String>,
    _guard: Option<LockGuard>,
}

impl CloneLease {
    /// Returns the volume IDs of the cloned image, base layer first.
    #[must_use]
    pub fn volume_ids(&self) -> &[String] {
        &self.volume_ids
    }
}

/// Clones images from a [`Fetcher`] into bundles.
pub struct RemoteCloner {
    fetcher: Arc<dyn Fetcher>,
    unpacker: Arc<dyn Unpacker>,
    volume_driver: Arc<dyn VolumeDriver>,
    lock: Option<StoreLock>,
}

impl RemoteCloner {
    /// Creates a cloner over its three collaborators.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        unpacker: Arc<dyn Unpacker>,
        volume_driver: Arc<dyn VolumeDriver>,
    ) -> Self {
        Self {
            fetcher,
            unpacker,
            volume_driver,
            lock: None,
        }
    }

    /// Coordinates with garbage collection through `lock`.
    ///
    /// The lock is held shared from the first volume lookup until the
    /// returned [`CloneLease`] is dropped.
    #[must_use]
    pub fn with_lock(mut self, lock: StoreLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Materializes `spec.image` into `spec.bundle`.
    ///
    /// Writes the image config to the bundle, makes sure a volume exists
    /// for every layer, then snapshots the top volume to the bundle rootfs.
    /// New volumes are built in staging and committed once their layer is
    /// applied. The bundle is left as it is on failure; a staged volume
    /// whose layer could not be applied is dropped.
    ///
    /// # Errors
    ///
    /// - `InvalidLocator` if `spec.image` cannot be parsed.
    /// - `Fetch` or `Streamer` if the image cannot be resolved.
    /// - `EmptyLayerChain` if the image has no layers.
    /// - `CreateVolume`, `StreamBlob` or `UnpackLayer` naming the layer that
    ///   failed.
    /// - `QuotaExceeded` if the unpacked layers outgrow `spec.disk_limit`.
    /// - `Snapshot` if the rootfs cannot be produced.
    pub fn clone_image(&self, ctx: &RequestContext, spec: &CloneSpec) -> Result<CloneLease> {
        let span = ctx.span("remote-cloning");
        let _enter = span.enter();
        tracing::info!(
            image = %spec.image,
            bundle = %spec.bundle.path().display(),
            "clone starting"
        );

        let locator = ImageLocator::parse(&spec.image)?;
        let (digests, config) =
            self.fetcher
                .layers_digest(&locator)
                .map_err(|e| StrataError::Fetch {
                    image: spec.image.clone(),
                    source: Box::new(e),
                })?;
        let Some(top) = digests.last() else {
            return Err(StrataError::EmptyLayerChain {
                image: spec.image.clone(),
            });
        };

        write_image_json(&spec.bundle.image_json_path(), &config)?;

        let streamer = self
            .fetcher
            .streamer(&locator)
            .map_err(|e| StrataError::Streamer {
                image: spec.image.clone(),
                source: Box::new(e),
            })?;

        let guard = self.lock.as_ref().map(StoreLock::shared).transpose()?;

        let mut quota_left = spec.quota();
        let mut volume_ids = Vec::with_capacity(digests.len());
        for digest in &digests {
            let volume_id = wrap_volume_id(spec, &digest.chain_id);
            volume_ids.push(volume_id.clone());

            // Only committed volumes are visible, so a hit is complete.
            if self.volume_driver.path(&volume_id).is_ok() {
                tracing::debug!(
                    volume = %volume_id,
                    blob_id = %digest.blob_id,
                    diff_id = %digest.diff_id,
                    parent_chain_id = %digest.parent_chain_id,
                    "volume exists, skipping layer"
                );
                continue;
            }
            let creating = self
                .lock
                .as_ref()
                .map(|lock| lock.volume(&volume_id))
                .transpose()?;
            if creating.is_some() && self.volume_driver.path(&volume_id).is_ok() {
                tracing::debug!(volume = %volume_id, "volume created concurrently, reusing");
                continue;
            }

            let parent_id = wrap_volume_id(spec, &digest.parent_chain_id);
            let staged = match self.volume_driver.create(&parent_id, &volume_id) {
                Ok(staged) => staged,
                Err(StrataError::VolumeExists { .. }) => {
                    tracing::debug!(volume = %volume_id, "volume created concurrently, reusing");
                    continue;
                }
                Err(e) => {
                    return Err(StrataError::CreateVolume {
                        diff_id: digest.diff_id.clone(),
                        source: Box::new(e),
                    });
                }
            };

            let (stream, size) = match streamer.stream(&digest.blob_id) {
                Ok(blob) => blob,
                Err(e) => {
                    self.abort_volume(&staged);
                    return Err(StrataError::StreamBlob {
                        blob_id: digest.blob_id.clone(),
                        source: Box::new(e),
                    });
                }
            };
            tracing::debug!(blob_id = %digest.blob_id, size, volume = %volume_id, "unpacking layer");

            let mut reader = QuotaedReader::new(stream, quota_left, spec.exclude_image_from_quota);
            let unpacked = self.unpacker.unpack(UnpackSpec {
                target_path: &staged.path,
                stream: &mut reader,
                uid_mappings: &spec.uid_mappings,
                gid_mappings: &spec.gid_mappings,
            });
            if let Err(e) = unpacked {
                self.abort_volume(&staged);
                if reader.exceeded() || e.is_quota_exceeded() {
                    tracing::warn!(volume = %volume_id, "layers exceed the disk quota");
                    return Err(StrataError::QuotaExceeded {
                        limit: spec.disk_limit.unwrap_or(0),
                    });
                }
                return Err(StrataError::UnpackLayer {
                    diff_id: digest.diff_id.clone(),
                    source: Box::new(e),
                });
            }
            quota_left = reader.quota_left();

            match self.volume_driver.commit(&staged) {
                Ok(_) => {}
                Err(StrataError::VolumeExists { .. }) => {
                    tracing::debug!(volume = %volume_id, "volume committed concurrently, reusing");
                }
                Err(e) => {
                    self.abort_volume(&staged);
                    return Err(StrataError::CreateVolume {
                        diff_id: digest.diff_id.clone(),
                        source: Box::new(e),
                    });
                }
            }
            drop(creating);
        }

        let rootfs = spec.bundle.rootfs_path();
        let top_volume = wrap_volume_id(spec, &top.chain_id);
        self.volume_driver
            .snapshot(&top_volume, &rootfs)
            .map_err(|e| StrataError::Snapshot {
                path: rootfs.clone(),
                source: Box::new(e),
            })?;

        tracing::info!(
            image = %spec.image,
            rootfs = %rootfs.display(),
            layers = volume_ids.len(),
            "clone finished"
        );
        Ok(CloneLease {
            volume_ids,
            _guard: guard,
        })
    }

    /// Drops a volume whose layer could not be applied.
    fn abort_volume(&self, staged: &StagedVolume) {
        if let Err(e) = self.volume_driver.abort(staged) {
            tracing::warn!(volume = %staged.id, error = %e, "failed to drop staged volume");
        }
    }
}

fn write_image_json(path: &Path, config: &ImageConfig) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
        .map_err(|e| StrataError::io(path, e))?;
    serde_json::to_writer(&mut file, config)?;
    file.write_all(b"\n").map_err(|e| StrataError::io(path, e))
}
