//! Test doubles for the collaborators of the image pipeline.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use strata_common::error::{Result, StrataError};
use strata_common::types::{IdMapping, ImageConfig, ImageLocator, LayerDigest};
use strata_store::bundle::{Bundle, Bundler};
use strata_store::dependency::DependencyManager;
use strata_store::volume::{StagedVolume, VolumeDriver};

use crate::fetcher::{BlobStream, Fetcher, Streamer};
use crate::layout::layer_digests;
use crate::unpack::{UnpackSpec, Unpacker};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().expect("test mutex poisoned")
}

/// Builds a consistent chain from `(blob, diff)` pairs.
pub fn chain(layers: &[(&str, &str)]) -> Vec<LayerDigest> {
    let blobs: Vec<String> = layers.iter().map(|(b, _)| (*b).to_string()).collect();
    let diffs: Vec<String> = layers.iter().map(|(_, d)| (*d).to_string()).collect();
    layer_digests("test", &blobs, &diffs).expect("chain")
}

#[derive(Default)]
pub struct FakeFetcher {
    pub digests: Vec<LayerDigest>,
    pub config: ImageConfig,
    pub blobs: HashMap<String, Vec<u8>>,
    pub fail_layers: bool,
    pub fail_streamer: bool,
    pub fail_stream: Option<String>,
    pub lookups: Mutex<Vec<String>>,
    pub streamed: Arc<Mutex<Vec<String>>>,
}

impl FakeFetcher {
    pub fn with_layers(digests: Vec<LayerDigest>) -> Self {
        let blobs = digests
            .iter()
            .map(|d| (d.blob_id.clone(), format!("content of {}", d.blob_id).into_bytes()))
            .collect();
        Self {
            digests,
            blobs,
            ..Self::default()
        }
    }

    pub fn streamed(&self) -> Vec<String> {
        lock(&self.streamed).clone()
    }
}

impl Fetcher for FakeFetcher {
    fn layers_digest(&self, locator: &ImageLocator) -> Result<(Vec<LayerDigest>, ImageConfig)> {
        lock(&self.lookups).push(locator.to_string());
        if self.fail_layers {
            return Err(StrataError::NotFound {
                kind: "image",
                id: locator.to_string(),
            });
        }
        Ok((self.digests.clone(), self.config.clone()))
    }

    fn streamer(&self, _locator: &ImageLocator) -> Result<Box<dyn Streamer>> {
        if self.fail_streamer {
            return Err(StrataError::Config {
                message: "no streamer".into(),
            });
        }
        Ok(Box::new(FakeStreamer {
            blobs: self.blobs.clone(),
            fail_stream: self.fail_stream.clone(),
            streamed: Arc::clone(&self.streamed),
        }))
    }
}

struct FakeStreamer {
    blobs: HashMap<String, Vec<u8>>,
    fail_stream: Option<String>,
    streamed: Arc<Mutex<Vec<String>>>,
}

impl Streamer for FakeStreamer {
    fn stream(&self, blob_id: &str) -> Result<BlobStream> {
        lock(&self.streamed).push(blob_id.to_string());
        if self.fail_stream.as_deref() == Some(blob_id) {
            return Err(StrataError::io("/registry", io::Error::other("connection reset")));
        }
        let data = self.blobs.get(blob_id).cloned().ok_or_else(|| StrataError::NotFound {
            kind: "blob",
            id: blob_id.to_string(),
        })?;
        let size = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), size))
    }
}

#[derive(Debug, Default)]
pub struct VolumeState {
    pub live: BTreeSet<String>,
    pub staged: BTreeSet<String>,
    pub marked: BTreeSet<String>,
    /// Listed as marked but already destroyed by someone else.
    pub vanished: BTreeSet<String>,
    pub created: Vec<(String, String)>,
    pub aborted: Vec<String>,
    pub snapshots: Vec<(String, PathBuf)>,
    pub destroyed: Vec<String>,
    pub fail_create: bool,
    pub create_conflicts: BTreeSet<String>,
    pub commit_conflicts: BTreeSet<String>,
    pub fail_snapshot: bool,
    pub fail_destroy: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct FakeVolumeDriver {
    state: Mutex<VolumeState>,
}

impl FakeVolumeDriver {
    pub fn with_volumes(ids: &[&str]) -> Self {
        let driver = Self::default();
        driver
            .state()
            .live
            .extend(ids.iter().map(|id| (*id).to_string()));
        driver
    }

    pub fn state(&self) -> MutexGuard<'_, VolumeState> {
        lock(&self.state)
    }

    fn fake_path(volume_id: &str) -> PathBuf {
        Path::new("/fake/volumes").join(volume_id)
    }

    fn staging_path(volume_id: &str) -> PathBuf {
        Path::new("/fake/tmp").join(volume_id)
    }
}

impl VolumeDriver for FakeVolumeDriver {
    fn path(&self, volume_id: &str) -> Result<PathBuf> {
        if self.state().live.contains(volume_id) {
            Ok(Self::fake_path(volume_id))
        } else {
            Err(StrataError::NotFound {
                kind: "volume",
                id: volume_id.to_string(),
            })
        }
    }

    fn create(&self, parent_id: &str, volume_id: &str) -> Result<StagedVolume> {
        let mut state = self.state();
        if state.fail_create {
            return Err(StrataError::io("/fake/volumes", io::Error::other("no space left")));
        }
        if state.create_conflicts.contains(volume_id) || state.live.contains(volume_id) {
            let _ = state.live.insert(volume_id.to_string());
            return Err(StrataError::VolumeExists {
                id: volume_id.to_string(),
            });
        }
        let _ = state.staged.insert(volume_id.to_string());
        state
            .created
            .push((parent_id.to_string(), volume_id.to_string()));
        Ok(StagedVolume {
            id: volume_id.to_string(),
            path: Self::staging_path(volume_id),
        })
    }

    fn commit(&self, staged: &StagedVolume) -> Result<PathBuf> {
        let mut state = self.state();
        let _ = state.staged.remove(&staged.id);
        if state.commit_conflicts.contains(&staged.id) {
            let _ = state.live.insert(staged.id.clone());
        }
        if !state.live.insert(staged.id.clone()) {
            return Err(StrataError::VolumeExists {
                id: staged.id.clone(),
            });
        }
        Ok(Self::fake_path(&staged.id))
    }

    fn abort(&self, staged: &StagedVolume) -> Result<()> {
        let mut state = self.state();
        let _ = state.staged.remove(&staged.id);
        state.aborted.push(staged.id.clone());
        Ok(())
    }

    fn snapshot(&self, volume_id: &str, destination: &Path) -> Result<()> {
        let mut state = self.state();
        if state.fail_snapshot {
            return Err(StrataError::io(destination, io::Error::other("snapshot failed")));
        }
        if !state.live.contains(volume_id) {
            return Err(StrataError::NotFound {
                kind: "volume",
                id: volume_id.to_string(),
            });
        }
        state
            .snapshots
            .push((volume_id.to_string(), destination.to_path_buf()));
        Ok(())
    }

    fn volumes(&self) -> Result<Vec<String>> {
        Ok(self.state().live.iter().cloned().collect())
    }

    fn mark_for_cleanup(&self, volume_id: &str) -> Result<()> {
        let mut state = self.state();
        if !state.live.remove(volume_id) {
            return Err(StrataError::NotFound {
                kind: "volume",
                id: volume_id.to_string(),
            });
        }
        let _ = state.marked.insert(volume_id.to_string());
        Ok(())
    }

    fn marked_volumes(&self) -> Result<Vec<String>> {
        let state = self.state();
        Ok(state.marked.union(&state.vanished).cloned().collect())
    }

    fn destroy_marked(&self, volume_id: &str) -> Result<bool> {
        let mut state = self.state();
        if state.fail_destroy.contains(volume_id) {
            return Err(StrataError::io(
                Self::fake_path(volume_id),
                io::Error::other("device busy"),
            ));
        }
        if !state.marked.remove(volume_id) {
            return Ok(false);
        }
        state.destroyed.push(volume_id.to_string());
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct UnpackCall {
    pub target: PathBuf,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct FakeUnpacker {
    pub fail: bool,
    pub calls: Mutex<Vec<UnpackCall>>,
}

impl FakeUnpacker {
    pub fn calls(&self) -> Vec<UnpackCall> {
        lock(&self.calls).clone()
    }
}

impl Unpacker for FakeUnpacker {
    fn unpack(&self, spec: UnpackSpec<'_>) -> Result<()> {
        if self.fail {
            return Err(StrataError::Unpack {
                entry: "bin/sh".into(),
                message: "corrupt archive".into(),
            });
        }
        let bytes = io::copy(spec.stream, &mut io::sink())
            .map_err(|e| StrataError::io(spec.target_path, e))?;
        lock(&self.calls).push(UnpackCall {
            target: spec.target_path.to_path_buf(),
            uid_mappings: spec.uid_mappings.to_vec(),
            gid_mappings: spec.gid_mappings.to_vec(),
            bytes,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeDependencyManager {
    pub sets: Mutex<BTreeMap<String, Vec<String>>>,
    pub fail_register: bool,
    pub fail_deregister: bool,
    pub deregistered: Mutex<Vec<String>>,
}

impl FakeDependencyManager {
    pub fn set(&self, consumer: &str) -> Option<Vec<String>> {
        lock(&self.sets).get(consumer).cloned()
    }
}

impl DependencyManager for FakeDependencyManager {
    fn register(&self, consumer_id: &str, resource_ids: &[String]) -> Result<()> {
        if self.fail_register {
            return Err(StrataError::io("/fake/deps", io::Error::other("read-only store")));
        }
        let _ = lock(&self.sets).insert(consumer_id.to_string(), resource_ids.to_vec());
        Ok(())
    }

    fn deregister(&self, consumer_id: &str) -> Result<()> {
        lock(&self.deregistered).push(consumer_id.to_string());
        if self.fail_deregister {
            return Err(StrataError::io("/fake/deps", io::Error::other("read-only store")));
        }
        let _ = lock(&self.sets).remove(consumer_id);
        Ok(())
    }

    fn dependencies(&self, consumer_id: &str) -> Result<Vec<String>> {
        self.set(consumer_id).ok_or_else(|| StrataError::NotFound {
            kind: "dependency consumer",
            id: consumer_id.to_string(),
        })
    }

    fn consumers(&self) -> Result<Vec<String>> {
        Ok(lock(&self.sets).keys().cloned().collect())
    }
}

/// Bundler creating real directories under a scratch root.
#[derive(Debug)]
pub struct FakeBundler {
    pub root: PathBuf,
    pub fail_destroy: bool,
    pub destroyed: Mutex<Vec<String>>,
}

impl FakeBundler {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            fail_destroy: false,
            destroyed: Mutex::new(Vec::new()),
        }
    }

    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.destroyed).clone()
    }
}

impl Bundler for FakeBundler {
    fn create(&self, id: &str) -> Result<Bundle> {
        let path = self.root.join(id);
        std::fs::create_dir_all(&path).map_err(|e| StrataError::io(&path, e))?;
        Ok(Bundle::new(id, path))
    }

    fn destroy(&self, id: &str) -> Result<()> {
        lock(&self.destroyed).push(id.to_string());
        if self.fail_destroy {
            return Err(StrataError::NotFound {
                kind: "image",
                id: id.to_string(),
            });
        }
        let path = self.root.join(id);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| StrataError::io(&path, e))?;
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.root.join(id).is_dir())
    }

    fn ids(&self) -> Result<Vec<String>> {
        strata_store::fsutil::list_dirs(&self.root)
    }
}
