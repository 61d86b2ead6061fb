//! Production wiring of the store collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_common::constants::DEPENDENCIES_DIR;
use strata_common::error::Result;
use strata_image::cloner::RemoteCloner;
use strata_image::creator::Creator;
use strata_image::deleter::Deleter;
use strata_image::gc::GarbageCollector;
use strata_image::layout::LayoutFetcher;
use strata_image::unpack::TarUnpacker;
use strata_store::bundle::DirBundler;
use strata_store::dependency::{FileDependencyStore, StoreDependencyManager};
use strata_store::lock::StoreLock;
use strata_store::volume::DirVolumeDriver;

/// Every on-disk collaborator of one store root.
pub struct Store {
    root: PathBuf,
    volumes: Arc<DirVolumeDriver>,
    bundler: Arc<DirBundler>,
    dependencies: Arc<StoreDependencyManager<FileDependencyStore>>,
    lock: StoreLock,
}

impl Store {
    /// Opens the store at `root`, creating its directories.
    pub fn open(root: &Path) -> Result<Self> {
        tracing::debug!(path = %root.display(), "opening store");
        let dependencies = FileDependencyStore::open(root.join(DEPENDENCIES_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
            volumes: Arc::new(DirVolumeDriver::open(root)?),
            bundler: Arc::new(DirBundler::open(root)?),
            dependencies: Arc::new(StoreDependencyManager::new(dependencies)),
            lock: StoreLock::open(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn bundler(&self) -> &Arc<DirBundler> {
        &self.bundler
    }

    pub fn creator(&self) -> Creator {
        let cloner = RemoteCloner::new(
            Arc::new(LayoutFetcher::new()),
            Arc::new(TarUnpacker::new()),
            self.volumes.clone(),
        )
        .with_lock(self.lock.clone());
        Creator::new(self.bundler.clone(), cloner, self.dependencies.clone())
    }

    pub fn deleter(&self) -> Deleter {
        Deleter::new(self.bundler.clone(), self.dependencies.clone())
    }

    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.volumes.clone(), self.dependencies.clone())
            .with_lock(self.lock.clone())
    }
}
