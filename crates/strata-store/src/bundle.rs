//! Image bundles: one directory per materialized image.
//!
//! A bundle holds `image.json` and the `rootfs/` the final volume is
//! snapshotted into.

use std::fs;
use std::path::{Path, PathBuf};

use strata_common::constants::{IMAGE_JSON_FILE, IMAGES_DIR, ROOTFS_DIR};
use strata_common::error::{Result, StrataError};

use crate::fsutil::{list_dirs, validate_id};

/// Handle to an on-disk bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    id: String,
    path: PathBuf,
}

impl Bundle {
    /// Wraps an existing bundle directory.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Returns the image ID the bundle belongs to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the bundle root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns where the merged root filesystem lives.
    #[must_use]
    pub fn rootfs_path(&self) -> PathBuf {
        self.path.join(ROOTFS_DIR)
    }

    /// Returns the path of the serialized image configuration.
    #[must_use]
    pub fn image_json_path(&self) -> PathBuf {
        self.path.join(IMAGE_JSON_FILE)
    }
}

/// Creates and destroys bundles.
pub trait Bundler: Send + Sync {
    /// Creates an empty bundle for `id`.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::AlreadyExists` if the ID is taken,
    /// `StrataError::InvalidId` if it cannot be used on disk.
    fn create(&self, id: &str) -> Result<Bundle>;

    /// Removes the bundle of `id` and everything in it.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::NotFound` if there is no such bundle.
    fn destroy(&self, id: &str) -> Result<()>;

    /// Returns `true` if a bundle exists for `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is invalid.
    fn exists(&self, id: &str) -> Result<bool>;

    /// Lists the IDs of every bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundles cannot be enumerated.
    fn ids(&self) -> Result<Vec<String>>;
}

/// Validates an image ID.
///
/// # Errors
///
/// Returns `StrataError::InvalidId` unless the ID is a non-empty run of
/// `[A-Za-z0-9._-]`.
pub fn validate_image_id(id: &str) -> Result<()> {
    validate_id("image", id, &[])
}

/// Bundles stored as `<store>/images/<id>`.
#[derive(Debug, Clone)]
pub struct DirBundler {
    dir: PathBuf,
}

impl DirBundler {
    /// Opens the bundler under the store root.
    ///
    /// # Errors
    ///
    /// Returns an error if the images directory cannot be created.
    pub fn open(store: &Path) -> Result<Self> {
        let dir = store.join(IMAGES_DIR);
        fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Returns the handle of an existing bundle.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::NotFound` if there is no such bundle.
    pub fn bundle(&self, id: &str) -> Result<Bundle> {
        if !self.exists(id)? {
            return Err(StrataError::NotFound {
                kind: "image",
                id: id.to_string(),
            });
        }
        Ok(Bundle::new(id, self.dir.join(id)))
    }
}

impl Bundler for DirBundler {
    fn create(&self, id: &str) -> Result<Bundle> {
        validate_image_id(id)?;
        let path = self.dir.join(id);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StrataError::AlreadyExists {
                    kind: "image",
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(StrataError::io(&path, e)),
        }
        tracing::debug!(image = id, path = %path.display(), "bundle created");
        Ok(Bundle::new(id, path))
    }

    fn destroy(&self, id: &str) -> Result<()> {
        let bundle = self.bundle(id)?;
        fs::remove_dir_all(bundle.path()).map_err(|e| StrataError::io(bundle.path(), e))?;
        tracing::debug!(image = id, "bundle destroyed");
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        validate_image_id(id)?;
        Ok(self.dir.join(id).is_dir())
    }

    fn ids(&self) -> Result<Vec<String>> {
        list_dirs(&self.dir)
    }
}
