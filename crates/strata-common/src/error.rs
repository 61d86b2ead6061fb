//! Unified error type for the strata workspace.
//!
//! Collaborator failures are wrapped with the identifier of the layer, blob
//! or path they concern, so callers can match on the variant instead of
//! parsing the message.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StrataError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identifier already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier of the conflicting resource.
        id: String,
    },

    /// An identifier contains characters that cannot be used on disk.
    #[error("invalid {kind} id `{id}`: {reason}")]
    InvalidId {
        /// Type of the identifier.
        kind: &'static str,
        /// The rejected identifier.
        id: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The image locator could not be parsed.
    #[error("parsing image locator `{locator}`: {reason}")]
    InvalidLocator {
        /// The rejected locator.
        locator: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The image content on the source is malformed or inconsistent.
    #[error("invalid image `{image}`: {message}")]
    InvalidImage {
        /// Locator or path of the image.
        image: String,
        /// Description of the problem.
        message: String,
    },

    /// The fetcher returned an image without any layer.
    #[error("image `{image}` has no layers")]
    EmptyLayerChain {
        /// Locator of the image.
        image: String,
    },

    /// Fetching the layer chain or the image configuration failed.
    #[error("fetching list of digests for `{image}`: {source}")]
    Fetch {
        /// Locator of the image.
        image: String,
        /// Underlying error.
        source: Box<StrataError>,
    },

    /// Initializing the blob streamer failed.
    #[error("initializing streamer for `{image}`: {source}")]
    Streamer {
        /// Locator of the image.
        image: String,
        /// Underlying error.
        source: Box<StrataError>,
    },

    /// Creating the volume for a layer failed.
    #[error("creating volume for layer `{diff_id}`: {source}")]
    CreateVolume {
        /// Diff ID of the failing layer.
        diff_id: String,
        /// Underlying error.
        source: Box<StrataError>,
    },

    /// Streaming a layer blob failed.
    #[error("streaming blob `{blob_id}`: {source}")]
    StreamBlob {
        /// Blob ID of the failing layer.
        blob_id: String,
        /// Underlying error.
        source: Box<StrataError>,
    },

    /// Unpacking a layer into its volume failed.
    #[error("unpacking layer `{diff_id}`: {source}")]
    UnpackLayer {
        /// Diff ID of the failing layer.
        diff_id: String,
        /// Underlying error.
        source: Box<StrataError>,
    },

    /// Snapshotting the final volume into the bundle failed.
    #[error("snapshotting the image to path `{path}`: {source}")]
    Snapshot {
        /// Destination rootfs path.
        path: PathBuf,
        /// Underlying error.
        source: Box<StrataError>,
    },

    /// A layer archive is malformed or cannot be applied.
    #[error("invalid layer entry `{entry}`: {message}")]
    Unpack {
        /// Path of the offending archive entry.
        entry: String,
        /// Description of the problem.
        message: String,
    },

    /// The layers being unpacked exceed the disk quota.
    #[error("layers exceed the disk quota of {limit} bytes")]
    QuotaExceeded {
        /// Quota in bytes the stream was started with.
        limit: u64,
    },

    /// The volume being created already exists.
    #[error("volume already exists: {id}")]
    VolumeExists {
        /// Identifier of the volume.
        id: String,
    },

    /// One or more marked volumes could not be destroyed.
    #[error("failed to destroy {} volume(s): {}", .failures.len(), FailureList(.failures))]
    Collect {
        /// Every volume that could not be destroyed, with its error.
        failures: Vec<CollectFailure>,
    },

    /// Acquiring the store lock failed.
    #[error("locking {path}: {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The operation is never valid on this object.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the misuse.
        message: &'static str,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StrataError {
    /// Builds an [`StrataError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` if this error, or any error it wraps, is a quota error.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. } => true,
            Self::Fetch { source, .. }
            | Self::Streamer { source, .. }
            | Self::CreateVolume { source, .. }
            | Self::StreamBlob { source, .. }
            | Self::UnpackLayer { source, .. }
            | Self::Snapshot { source, .. } => source.is_quota_exceeded(),
            _ => false,
        }
    }
}

/// A volume that survived a collection sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectFailure {
    /// Identifier of the volume.
    pub volume_id: String,
    /// Rendered error returned by the driver.
    pub error: String,
}

struct FailureList<'a>(&'a [CollectFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.volume_id, failure.error)?;
        }
        Ok(())
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StrataError>;
