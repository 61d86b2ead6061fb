//! Copy-on-write layer volumes.
//!
//! A volume holds the cumulative filesystem state of one layer chain and is
//! keyed by its (namespaced) chain ID. Child volumes start as a copy of
//! their parent in a staging directory. The layer is unpacked there and the
//! volume is committed into the namespace only once it is complete. The
//! final volume is snapshotted into a bundle's rootfs.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use strata_common::constants::{GC_DIR, TMP_DIR, VOLUMES_DIR};
use strata_common::error::{Result, StrataError};

use crate::fsutil::{copy_tree, dir_size, list_dirs, validate_id};

/// A volume being built.
///
/// Its content lives outside the volume namespace: [`VolumeDriver::path`]
/// and [`VolumeDriver::volumes`] do not see it until it is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedVolume {
    /// ID the volume is committed under.
    pub id: String,
    /// Directory to apply the layer to.
    pub path: PathBuf,
}

/// Backend that owns the volume namespace.
///
/// A volume ID always names complete content: volumes are built in staging
/// and only enter the namespace through [`VolumeDriver::commit`].
/// Implementations must tolerate concurrent creation of the same volume by
/// reporting [`StrataError::VolumeExists`] to the loser.
pub trait VolumeDriver: Send + Sync {
    /// Returns the path of an existing volume.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::NotFound` if the volume does not exist.
    fn path(&self, volume_id: &str) -> Result<PathBuf>;

    /// Stages `volume_id` on top of `parent_id` (empty for no parent).
    ///
    /// # Errors
    ///
    /// Returns `StrataError::VolumeExists` if the volume is already there, or
    /// a backend error.
    fn create(&self, parent_id: &str, volume_id: &str) -> Result<StagedVolume>;

    /// Publishes a staged volume under its ID and returns its path.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::VolumeExists` if another commit of the same ID
    /// won; the staged content is dropped in that case.
    fn commit(&self, staged: &StagedVolume) -> Result<PathBuf>;

    /// Drops a staged volume that will not be committed.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged content cannot be removed.
    fn abort(&self, staged: &StagedVolume) -> Result<()>;

    /// Materializes the content of `volume_id` at `destination`.
    ///
    /// Regular files, directories, symlinks, FIFOs and device nodes are
    /// copied; sockets are not.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is missing or the copy fails.
    fn snapshot(&self, volume_id: &str, destination: &Path) -> Result<()>;

    /// Lists every live volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be enumerated.
    fn volumes(&self) -> Result<Vec<String>>;

    /// Removes a volume from the live namespace so it can be collected.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be moved.
    fn mark_for_cleanup(&self, volume_id: &str) -> Result<()>;

    /// Lists volumes marked for cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error if the marked volumes cannot be enumerated.
    fn marked_volumes(&self) -> Result<Vec<String>>;

    /// Destroys a volume marked for cleanup. Live volumes are never touched.
    ///
    /// Returns `false` if no marked volume of that ID exists, for example
    /// because a concurrent collect destroyed it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be removed.
    fn destroy_marked(&self, volume_id: &str) -> Result<bool>;
}

/// Directory-backed volume driver.
///
/// Layout under the store root:
/// - `volumes/<id>`: live volumes
/// - `gc/<id>`: volumes marked for cleanup
/// - `tmp/`: staging area for volumes being created
#[derive(Debug, Clone)]
pub struct DirVolumeDriver {
    root: PathBuf,
}

impl DirVolumeDriver {
    /// Opens the driver, creating its directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tracing::info!(path = %root.display(), "opening volume driver");
        for sub in [VOLUMES_DIR, GC_DIR, TMP_DIR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the on-disk size of a live volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume is missing or cannot be read.
    pub fn volume_size(&self, volume_id: &str) -> Result<u64> {
        dir_size(&self.path(volume_id)?)
    }

    fn live_path(&self, volume_id: &str) -> PathBuf {
        self.root.join(VOLUMES_DIR).join(volume_id)
    }

    fn marked_path(&self, volume_id: &str) -> PathBuf {
        self.root.join(GC_DIR).join(volume_id)
    }

    /// Refuses staged paths that are not a direct child of the staging area.
    fn check_staged(&self, staged: &StagedVolume) -> Result<()> {
        if staged.path.parent() == Some(self.root.join(TMP_DIR).as_path()) {
            Ok(())
        } else {
            Err(StrataError::InvalidOperation {
                message: "path is not a staged volume of this store",
            })
        }
    }
}

fn validate_volume_id(volume_id: &str) -> Result<()> {
    validate_id("volume", volume_id, &[':', '+'])
}

impl VolumeDriver for DirVolumeDriver {
    fn path(&self, volume_id: &str) -> Result<PathBuf> {
        validate_volume_id(volume_id)?;
        let path = self.live_path(volume_id);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(StrataError::NotFound {
                kind: "volume",
                id: volume_id.to_string(),
            })
        }
    }

    fn create(&self, parent_id: &str, volume_id: &str) -> Result<StagedVolume> {
        validate_volume_id(volume_id)?;
        if self.live_path(volume_id).exists() {
            return Err(StrataError::VolumeExists {
                id: volume_id.to_string(),
            });
        }

        let tmp = self.root.join(TMP_DIR);
        let staging = tempfile::Builder::new()
            .prefix("volume-")
            .tempdir_in(&tmp)
            .map_err(|e| StrataError::io(&tmp, e))?;
        if parent_id.is_empty() {
            fs::set_permissions(staging.path(), fs::Permissions::from_mode(0o755))
                .map_err(|e| StrataError::io(staging.path(), e))?;
        } else {
            let parent = self.path(parent_id)?;
            copy_tree(&parent, staging.path())?;
        }

        tracing::debug!(volume = volume_id, parent = parent_id, "volume staged");
        Ok(StagedVolume {
            id: volume_id.to_string(),
            path: staging.keep(),
        })
    }

    fn commit(&self, staged: &StagedVolume) -> Result<PathBuf> {
        validate_volume_id(&staged.id)?;
        self.check_staged(staged)?;
        let target = self.live_path(&staged.id);
        if target.exists() {
            self.abort(staged)?;
            return Err(StrataError::VolumeExists {
                id: staged.id.clone(),
            });
        }
        if let Err(e) = fs::rename(&staged.path, &target) {
            let _ = fs::remove_dir_all(&staged.path);
            if target.exists() {
                return Err(StrataError::VolumeExists {
                    id: staged.id.clone(),
                });
            }
            return Err(StrataError::io(&target, e));
        }

        tracing::debug!(volume = %staged.id, "volume committed");
        Ok(target)
    }

    fn abort(&self, staged: &StagedVolume) -> Result<()> {
        self.check_staged(staged)?;
        match fs::remove_dir_all(&staged.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StrataError::io(&staged.path, e)),
        }
        tracing::debug!(volume = %staged.id, "staged volume dropped");
        Ok(())
    }

    fn snapshot(&self, volume_id: &str, destination: &Path) -> Result<()> {
        let source = self.path(volume_id)?;
        copy_tree(&source, destination)?;
        tracing::debug!(
            volume = volume_id,
            destination = %destination.display(),
            "volume snapshotted"
        );
        Ok(())
    }

    fn volumes(&self) -> Result<Vec<String>> {
        list_dirs(&self.root.join(VOLUMES_DIR))
    }

    fn mark_for_cleanup(&self, volume_id: &str) -> Result<()> {
        let live = self.path(volume_id)?;
        let marked = self.marked_path(volume_id);
        if marked.exists() {
            // Left over from an earlier sweep; it is garbage either way.
            fs::remove_dir_all(&marked).map_err(|e| StrataError::io(&marked, e))?;
        }
        fs::rename(&live, &marked).map_err(|e| StrataError::io(&live, e))?;
        tracing::debug!(volume = volume_id, "volume marked for cleanup");
        Ok(())
    }

    fn marked_volumes(&self) -> Result<Vec<String>> {
        list_dirs(&self.root.join(GC_DIR))
    }

    fn destroy_marked(&self, volume_id: &str) -> Result<bool> {
        validate_volume_id(volume_id)?;
        let marked = self.marked_path(volume_id);
        match fs::remove_dir_all(&marked) {
            Ok(()) => {
                tracing::debug!(volume = volume_id, "volume destroyed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StrataError::io(&marked, e)),
        }
    }
}
