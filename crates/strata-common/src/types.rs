//! Domain primitive types used across the strata workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Content-addressed identifiers of one layer of an image.
///
/// Layer chains are ordered root-to-leaf: the `parent_chain_id` of every
/// digest is the `chain_id` of the digest before it, and the first digest
/// has an empty parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerDigest {
    /// Identifier of the fetchable (possibly compressed) blob.
    pub blob_id: String,
    /// Identifier of this layer's own uncompressed content.
    pub diff_id: String,
    /// Identifier of the cumulative filesystem state up to this layer.
    pub chain_id: String,
    /// Chain ID of the layer below, empty for the base layer.
    pub parent_chain_id: String,
}

/// A contiguous range of IDs mapped from a user namespace to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdMapping {
    /// First ID inside the namespace.
    pub namespace_id: u32,
    /// First ID on the host the range maps to.
    pub host_id: u32,
    /// Number of IDs in the range.
    pub size: u32,
}

impl IdMapping {
    /// Creates a new mapping.
    #[must_use]
    pub const fn new(namespace_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            namespace_id,
            host_id,
            size,
        }
    }

    /// Maps a namespace ID to its host ID, if it falls in this range.
    #[must_use]
    pub fn map(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.namespace_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

/// Maps `id` through the first matching range of `mappings`.
#[must_use]
pub fn map_id(mappings: &[IdMapping], id: u32) -> Option<u32> {
    mappings.iter().find_map(|m| m.map(id))
}

impl FromStr for IdMapping {
    type Err = StrataError;

    /// Parses `NAMESPACE_ID:HOST_ID:SIZE`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StrataError::Config {
            message: format!("invalid id mapping `{s}`, expected NAMESPACE_ID:HOST_ID:SIZE"),
        };
        let mut parts = s.split(':').map(|p| p.trim().parse::<u32>());
        let (Some(Ok(namespace_id)), Some(Ok(host_id)), Some(Ok(size)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if size == 0 {
            return Err(invalid());
        }
        Ok(Self::new(namespace_id, host_id, size))
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.host_id, self.size)
    }
}

/// A parsed image locator such as `oci:///var/images/busybox`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageLocator {
    scheme: String,
    reference: String,
}

impl ImageLocator {
    /// Parses a `scheme://reference` locator.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::InvalidLocator` if the scheme is missing or
    /// malformed, or the reference is empty.
    pub fn parse(locator: &str) -> Result<Self> {
        let invalid = |reason: &str| StrataError::InvalidLocator {
            locator: locator.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, reference) = locator
            .split_once("://")
            .ok_or_else(|| invalid("missing `://` separator"))?;
        let mut chars = scheme.chars();
        let valid_scheme = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(invalid("invalid scheme"));
        }
        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.chars().any(char::is_control) {
            return Err(invalid("control character in reference"));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            reference: reference.to_string(),
        })
    }

    /// Returns the lowercase scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns everything after `://`.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

impl fmt::Display for ImageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.reference)
    }
}

/// The `rootfs` section of an image configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Diff IDs of the layers, base first.
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

/// OCI image configuration, persisted as `image.json` in every bundle.
///
/// Keys without a typed field are kept as-is so that the written file
/// matches what the image shipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// CPU architecture the image was built for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Operating system the image was built for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    /// Execution parameters (entrypoint, env, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Layer diff IDs.
    #[serde(default)]
    pub rootfs: RootFs,
    /// Build history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<serde_json::Value>,
    /// Any other key.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Dependency consumer ID of a materialized image.
#[must_use]
pub fn image_consumer(image_id: &str) -> String {
    format!("image:{image_id}")
}

/// Dependency consumer ID of a base image, keyed by its locator.
#[must_use]
pub fn base_image_consumer(locator: &str) -> String {
    format!("baseimage:{locator}")
}
