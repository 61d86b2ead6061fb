//! System-wide constants and default paths.

/// Default store directory.
pub const DEFAULT_STORE_PATH: &str = "/var/lib/strata/store";

/// File name of the serialized image configuration inside a bundle.
pub const IMAGE_JSON_FILE: &str = "image.json";

/// Directory name of the root filesystem inside a bundle.
pub const ROOTFS_DIR: &str = "rootfs";

/// Suffix appended to volume IDs unpacked with UID/GID mappings.
pub const NAMESPACED_SUFFIX: &str = "-namespaced";

/// Store subdirectory holding live volumes.
pub const VOLUMES_DIR: &str = "volumes";

/// Store subdirectory holding volumes marked for collection.
pub const GC_DIR: &str = "gc";

/// Store subdirectory holding bundles.
pub const IMAGES_DIR: &str = "images";

/// Store subdirectory holding dependency records.
pub const DEPENDENCIES_DIR: &str = "dependencies";

/// Store subdirectory for staging in-progress volumes.
pub const TMP_DIR: &str = "tmp";

/// Store subdirectory for lock files.
pub const LOCKS_DIR: &str = "locks";

/// Lock file serializing garbage collection against clones.
pub const GC_LOCK_FILE: &str = "gc.lock";

/// Quota value meaning "no limit".
pub const UNLIMITED_QUOTA: i64 = -1;

/// Application name used in CLI output.
pub const APP_NAME: &str = "strata";
