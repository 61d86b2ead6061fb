//! Global configuration model for strata.
//!
//! Values come from an optional YAML file; command-line flags override
//! them field by field.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::IdMapping;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    /// Directory holding volumes, bundles and dependency records.
    pub store: PathBuf,
    /// UID mappings in `NAMESPACE_ID:HOST_ID:SIZE` form.
    pub uid_mappings: Vec<String>,
    /// GID mappings in `NAMESPACE_ID:HOST_ID:SIZE` form.
    pub gid_mappings: Vec<String>,
    /// Inclusive disk limit applied while unpacking an image.
    pub disk_limit_size_bytes: Option<u64>,
    /// Do not count the base image layers against the disk limit.
    pub exclude_image_from_quota: bool,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from(crate::constants::DEFAULT_STORE_PATH),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            disk_limit_size_bytes: None,
            exclude_image_from_quota: false,
            log_format: LogFormat::default(),
        }
    }
}

impl StrataConfig {
    /// Loads a configuration file; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML for
    /// this model.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::io(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| StrataError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Parses the configured UID mappings.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Config` if any entry is malformed.
    pub fn parsed_uid_mappings(&self) -> Result<Vec<IdMapping>> {
        self.uid_mappings.iter().map(|m| m.parse()).collect()
    }

    /// Parses the configured GID mappings.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Config` if any entry is malformed.
    pub fn parsed_gid_mappings(&self) -> Result<Vec<IdMapping>> {
        self.gid_mappings.iter().map(|m| m.parse()).collect()
    }
}
