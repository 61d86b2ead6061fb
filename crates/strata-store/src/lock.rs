//! Store-wide lock serializing garbage collection against clones.
//!
//! Clones hold the lock shared from their first volume lookup until their
//! dependencies are registered; the mark phase of garbage collection holds
//! it exclusively. Creating a volume also takes a per-volume lock, so a
//! second clone of the same layer waits for the first to commit and then
//! reuses its volume instead of building a copy of its own. Volumes are
//! only visible once committed either way (see [`crate::volume`]).
//! `flock(2)` locks belong to the open file description, so
//! the lock works between threads of one process and between processes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use strata_common::constants::{GC_LOCK_FILE, LOCKS_DIR};
use strata_common::error::{Result, StrataError};

use crate::fsutil::validate_id;

/// The lock file of one store.
#[derive(Debug, Clone)]
pub struct StoreLock {
    dir: PathBuf,
    path: PathBuf,
}

/// A held lock; released on drop.
pub struct LockGuard {
    _lock: Flock<File>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

impl StoreLock {
    /// Opens the garbage-collection lock of the store rooted at `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the locks directory cannot be created.
    pub fn open(store: &Path) -> Result<Self> {
        let dir = store.join(LOCKS_DIR);
        fs::create_dir_all(&dir).map_err(|e| StrataError::io(&dir, e))?;
        Ok(Self {
            path: dir.join(GC_LOCK_FILE),
            dir,
        })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the lock is held shared.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Lock` if the lock file cannot be opened or locked.
    pub fn shared(&self) -> Result<LockGuard> {
        self.acquire(FlockArg::LockShared)
    }

    /// Blocks until the lock is held exclusively.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Lock` if the lock file cannot be opened or locked.
    pub fn exclusive(&self) -> Result<LockGuard> {
        self.acquire(FlockArg::LockExclusive)
    }

    /// Takes the exclusive lock only if nobody holds it.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Lock` if the lock file cannot be opened or the
    /// lock call fails for a reason other than contention.
    pub fn try_exclusive(&self) -> Result<Option<LockGuard>> {
        match self.acquire(FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(guard)),
            Err(StrataError::Lock { source, .. })
                if source.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Blocks until the creation lock of `volume_id` is held exclusively.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::InvalidId` for an ID that is not a single path
    /// component, or `StrataError::Lock` if the lock file cannot be opened or
    /// locked.
    pub fn volume(&self, volume_id: &str) -> Result<LockGuard> {
        validate_id("volume", volume_id, &[':', '+'])?;
        let path = self.dir.join(format!("volume-{volume_id}.lock"));
        lock_file(&path, FlockArg::LockExclusive)
    }

    fn acquire(&self, arg: FlockArg) -> Result<LockGuard> {
        lock_file(&self.path, arg)
    }
}

fn lock_file(path: &Path, arg: FlockArg) -> Result<LockGuard> {
    let lock_err = |source| StrataError::Lock {
        path: path.to_path_buf(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(lock_err)?;
    let lock = Flock::lock(file, arg).map_err(|(_, errno)| lock_err(errno.into()))?;
    Ok(LockGuard { _lock: lock })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = StoreLock::open(dir.path()).expect("open");
        let _a = lock.shared().expect("first shared");
        let _b = lock.shared().expect("second shared");
        assert!(lock.try_exclusive().expect("try").is_none());
    }

    #[test]
    fn exclusive_is_available_once_shared_guards_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = StoreLock::open(dir.path()).expect("open");
        let guard = lock.shared().expect("shared");
        drop(guard);
        let exclusive = lock.try_exclusive().expect("try");
        assert!(exclusive.is_some());
        assert!(lock.path().exists());
    }

    #[test]
    fn volume_locks_are_independent_of_the_gc_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = StoreLock::open(dir.path()).expect("open");
        let _creating = lock.volume("sha256:abc").expect("volume lock");
        let _other = lock.volume("sha256:def").expect("other volume lock");
        assert!(lock.try_exclusive().expect("try").is_some());
        assert!(dir.path().join("locks/volume-sha256:abc.lock").exists());
    }

    #[test]
    fn exclusive_excludes_other_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = StoreLock::open(dir.path()).expect("open");
        let _held = lock.exclusive().expect("exclusive");
        assert!(lock.try_exclusive().expect("try").is_none());
    }
}
