//! Dependency tracking between images and the volumes they need.
//!
//! Every consumer (an image, or the base image it was cloned from) owns one
//! record listing the resources (volume IDs) it depends on. A volume is
//! eligible for destruction only when no record lists it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_common::error::{Result, StrataError};

/// Key/value persistence behind a [`StoreDependencyManager`].
pub trait DependencyStore: Send + Sync {
    /// Replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn delete(&self, key: &str) -> Result<()>;

    /// Lists every key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn keys(&self) -> Result<Vec<String>>;
}

/// File-per-key store: `<dir>/<sha256 of key>.json`.
///
/// Each file starts with the key as a JSON string on its own line,
/// followed by the value. File names stay short however long the key is.
/// Writes go to a temporary file in the same directory that is renamed over
/// the target, so readers never see a partial record and concurrent writers
/// of one key resolve to the last rename.
#[derive(Debug, Clone)]
pub struct FileDependencyStore {
    dir: PathBuf,
}

const RECORD_EXTENSION: &str = ".json";

impl FileDependencyStore {
    /// Opens the store, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{digest:x}{RECORD_EXTENSION}"))
    }

    fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrataError::io(path, e)),
        }
    }
}

/// Splits a record file into its key and value.
fn split_record(bytes: &[u8]) -> Option<(String, &[u8])> {
    let newline = bytes.iter().position(|b| *b == b'\n')?;
    let key = serde_json::from_slice(&bytes[..newline]).ok()?;
    Some((key, &bytes[newline + 1..]))
}

impl DependencyStore for FileDependencyStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let target = self.key_path(key);
        let mut header = serde_json::to_vec(key)?;
        header.push(b'\n');
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| StrataError::io(&self.dir, e))?;
        tmp.write_all(&header)
            .and_then(|()| tmp.write_all(value))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StrataError::io(tmp.path(), e))?;
        let _ = tmp
            .persist(&target)
            .map_err(|e| StrataError::io(&target, e.error))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        let Some(bytes) = Self::read_file(&path)? else {
            return Ok(None);
        };
        match split_record(&bytes) {
            Some((stored, value)) if stored == key => Ok(Some(value.to_vec())),
            _ => {
                tracing::warn!(path = %path.display(), key, "ignoring malformed dependency record");
                Ok(None)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::io(&path, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| StrataError::io(&self.dir, e))? {
            let entry = entry.map_err(|e| StrataError::io(&self.dir, e))?;
            let path = entry.path();
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(RECORD_EXTENSION))
            {
                continue;
            }
            // Removed by a concurrent deregistration.
            let Some(bytes) = Self::read_file(&path)? else {
                continue;
            };
            if let Some((key, _)) = split_record(&bytes) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process store, for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryDependencyStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDependencyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DependencyStore for MemoryDependencyStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let _ = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _ = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }
}

/// Tracks which resources each consumer depends on.
pub trait DependencyManager: Send + Sync {
    /// Replaces the dependency set of `consumer_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn register(&self, consumer_id: &str, resource_ids: &[String]) -> Result<()>;

    /// Drops every dependency of `consumer_id`. Unknown consumers are not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    fn deregister(&self, consumer_id: &str) -> Result<()>;

    /// Returns the dependency set of `consumer_id`.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::NotFound` if the consumer never registered (an
    /// empty registration yields an empty list instead).
    fn dependencies(&self, consumer_id: &str) -> Result<Vec<String>>;

    /// Lists every registered consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be enumerated.
    fn consumers(&self) -> Result<Vec<String>>;

    /// Lists the consumers whose set contains `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    fn dependents(&self, resource_id: &str) -> Result<Vec<String>> {
        let mut dependents = Vec::new();
        for consumer in self.consumers()? {
            match self.dependencies(&consumer) {
                Ok(resources) if resources.iter().any(|r| r == resource_id) => {
                    dependents.push(consumer);
                }
                Ok(_) | Err(StrataError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(dependents)
    }
}

/// Persisted form of one consumer's dependency set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// Consumer owning the record.
    pub consumer: String,
    /// Resources the consumer depends on, in registration order.
    pub resources: Vec<String>,
    /// When the set was last replaced.
    pub registered_at: DateTime<Utc>,
}

/// [`DependencyManager`] persisting one JSON record per consumer in a
/// [`DependencyStore`].
#[derive(Debug)]
pub struct StoreDependencyManager<S> {
    store: S,
}

impl<S: DependencyStore> StoreDependencyManager<S> {
    /// Creates a manager over `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the full record of `consumer_id`, if registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or parsed.
    pub fn record(&self, consumer_id: &str) -> Result<Option<DependencyRecord>> {
        self.store
            .get(consumer_id)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StrataError::from))
            .transpose()
    }
}

impl<S: DependencyStore> DependencyManager for StoreDependencyManager<S> {
    fn register(&self, consumer_id: &str, resource_ids: &[String]) -> Result<()> {
        let mut seen = HashSet::new();
        let resources = resource_ids
            .iter()
            .filter(|r| seen.insert(r.as_str()))
            .cloned()
            .collect();
        let record = DependencyRecord {
            consumer: consumer_id.to_string(),
            resources,
            registered_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)?;
        self.store.put(consumer_id, &bytes)?;
        tracing::debug!(
            consumer = consumer_id,
            resources = ?record.resources,
            "dependencies registered"
        );
        Ok(())
    }

    fn deregister(&self, consumer_id: &str) -> Result<()> {
        self.store.delete(consumer_id)?;
        tracing::debug!(consumer = consumer_id, "dependencies deregistered");
        Ok(())
    }

    fn dependencies(&self, consumer_id: &str) -> Result<Vec<String>> {
        self.record(consumer_id)?
            .map(|record| record.resources)
            .ok_or_else(|| StrataError::NotFound {
                kind: "dependency consumer",
                id: consumer_id.to_string(),
            })
    }

    fn consumers(&self) -> Result<Vec<String>> {
        self.store.keys()
    }
}
