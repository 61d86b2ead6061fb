//! Disk usage of a store.

use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_common::constants::{GC_DIR, IMAGES_DIR, VOLUMES_DIR};
use strata_common::error::Result;

use crate::fsutil::{dir_size, list_dirs};

/// Size of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUsage {
    /// Volume ID.
    pub id: String,
    /// Apparent size in bytes.
    pub bytes: u64,
}

/// Snapshot of the disk usage of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Live volumes, sorted by ID.
    pub volumes: Vec<VolumeUsage>,
    /// Total size of the live volumes.
    pub volumes_bytes: u64,
    /// Volumes marked for cleanup but not collected yet.
    pub marked_volumes: usize,
    /// Total size of the marked volumes.
    pub marked_bytes: u64,
    /// Number of images.
    pub images: usize,
    /// Total size of the image bundles.
    pub images_bytes: u64,
}

impl StoreStats {
    /// Returns the bytes held by volumes and bundles together.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.volumes_bytes + self.marked_bytes + self.images_bytes
    }
}

/// Walks the store rooted at `store` and sums its usage.
///
/// # Errors
///
/// Returns an error if part of the store cannot be read.
pub fn collect_stats(store: &Path) -> Result<StoreStats> {
    tracing::debug!(path = %store.display(), "collecting store stats");
    let mut stats = StoreStats::default();

    let volumes = store.join(VOLUMES_DIR);
    for id in list_dirs(&volumes)? {
        let bytes = dir_size(&volumes.join(&id))?;
        stats.volumes_bytes += bytes;
        stats.volumes.push(VolumeUsage { id, bytes });
    }

    let marked = store.join(GC_DIR);
    for id in list_dirs(&marked)? {
        stats.marked_bytes += dir_size(&marked.join(&id))?;
        stats.marked_volumes += 1;
    }

    let images = store.join(IMAGES_DIR);
    for id in list_dirs(&images)? {
        stats.images_bytes += dir_size(&images.join(&id))?;
        stats.images += 1;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn empty_or_missing_store_has_no_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stats = collect_stats(&dir.path().join("missing")).expect("stats");
        assert_eq!(stats, StoreStats::default());
        assert_eq!(stats.total_bytes(), 0);
    }

    #[test]
    fn sums_volumes_marked_volumes_and_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("volumes/sha256:a/etc")).expect("mkdir");
        fs::write(root.join("volumes/sha256:a/etc/hosts"), "0123456789").expect("write");
        fs::create_dir_all(root.join("volumes/sha256:b")).expect("mkdir");
        fs::write(root.join("volumes/sha256:b/f"), "abc").expect("write");
        fs::create_dir_all(root.join("gc/sha256:old")).expect("mkdir");
        fs::write(root.join("gc/sha256:old/f"), "12345").expect("write");
        fs::create_dir_all(root.join("images/web/rootfs")).expect("mkdir");
        fs::write(root.join("images/web/image.json"), "{}\n").expect("write");

        let stats = collect_stats(root).expect("stats");
        assert_eq!(
            stats.volumes,
            vec![
                VolumeUsage {
                    id: "sha256:a".into(),
                    bytes: 10
                },
                VolumeUsage {
                    id: "sha256:b".into(),
                    bytes: 3
                },
            ]
        );
        assert_eq!(stats.volumes_bytes, 13);
        assert_eq!(stats.marked_volumes, 1);
        assert_eq!(stats.marked_bytes, 5);
        assert_eq!(stats.images, 1);
        assert_eq!(stats.images_bytes, 3);
        assert_eq!(stats.total_bytes(), 21);
    }
}
