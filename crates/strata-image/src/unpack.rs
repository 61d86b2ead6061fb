//! Applying layer archives onto volumes.
//!
//! Layers are tar streams. Besides regular entries they carry OCI
//! whiteouts: `.wh.<name>` deletes `<name>` from the layers below and
//! `.wh..wh..opq` hides everything a directory held before this layer.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use strata_common::error::{Result, StrataError};
use strata_common::types::{IdMapping, map_id};

use crate::quota::quota_exceeded_limit;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Everything needed to unpack one layer.
pub struct UnpackSpec<'a> {
    /// Volume directory the layer is applied to.
    pub target_path: &'a Path,
    /// Uncompressed layer archive.
    pub stream: &'a mut dyn Read,
    /// Ownership mappings for user-namespaced images.
    pub uid_mappings: &'a [IdMapping],
    /// Group mappings for user-namespaced images.
    pub gid_mappings: &'a [IdMapping],
}

/// Applies a layer stream to a directory.
pub trait Unpacker: Send + Sync {
    /// Unpacks `spec.stream` into `spec.target_path`.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::QuotaExceeded` if the stream ran over its quota,
    /// or an error describing the entry or I/O operation that failed.
    fn unpack(&self, spec: UnpackSpec<'_>) -> Result<()>;
}

/// Unpacker for (uncompressed) tar layers.
#[derive(Debug, Clone, Default)]
pub struct TarUnpacker;

impl TarUnpacker {
    /// Creates an unpacker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Maps I/O errors of the archive, surfacing quota errors of the stream.
fn archive_error(target: &Path, e: io::Error) -> StrataError {
    match quota_exceeded_limit(&e) {
        Some(limit) => StrataError::QuotaExceeded { limit },
        None => StrataError::io(target, e),
    }
}

/// Strips `.` components and rejects paths leaving the layer root.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resolves the directory holding an entry, following symlinks.
///
/// `root` is the canonical layer root. Returns `None` when there is no such
/// directory below `root`, and an error when it resolves outside of `root`.
/// Anything removed on behalf of an entry goes through here first.
fn resolve_parent(root: &Path, parent: &Path, entry: &Path) -> Result<Option<PathBuf>> {
    let dir = root.join(parent);
    let resolved = match dir.canonicalize() {
        Ok(resolved) => resolved,
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
        {
            return Ok(None);
        }
        Err(e) => return Err(StrataError::io(&dir, e)),
    };
    if !resolved.starts_with(root) {
        return Err(StrataError::Unpack {
            entry: entry.display().to_string(),
            message: "path escapes the layer root".into(),
        });
    }
    Ok(resolved.is_dir().then_some(resolved))
}

fn map_owner(
    entry_name: &Path,
    id: u64,
    mappings: &[IdMapping],
    kind: &str,
) -> Result<u32> {
    let unmapped = || StrataError::Unpack {
        entry: entry_name.display().to_string(),
        message: format!("{kind} {id} has no mapping"),
    };
    let id = u32::try_from(id).map_err(|_| unmapped())?;
    map_id(mappings, id).ok_or_else(unmapped)
}

impl Unpacker for TarUnpacker {
    fn unpack(&self, spec: UnpackSpec<'_>) -> Result<()> {
        let target = spec.target_path;
        let remap = !spec.uid_mappings.is_empty() || !spec.gid_mappings.is_empty();
        let root = target
            .canonicalize()
            .map_err(|e| StrataError::io(target, e))?;
        let mut archive = tar::Archive::new(spec.stream);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);

        // Paths written by this layer; opaque whiteouts only hide older ones.
        let mut written: HashSet<PathBuf> = HashSet::new();
        let mut entries = 0usize;

        for entry in archive.entries().map_err(|e| archive_error(target, e))? {
            let mut entry = entry.map_err(|e| archive_error(target, e))?;
            let raw_path = entry.path().map_err(|e| archive_error(target, e))?.into_owned();
            let Some(rel) = normalize_entry_path(&raw_path) else {
                return Err(StrataError::Unpack {
                    entry: raw_path.display().to_string(),
                    message: "path escapes the layer root".into(),
                });
            };
            let Some(name) = rel.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();

            if name == OPAQUE_WHITEOUT {
                if let Some(dir) = resolve_parent(&root, &parent, &rel)? {
                    for child in fs::read_dir(&dir).map_err(|e| StrataError::io(&dir, e))? {
                        let child = child.map_err(|e| StrataError::io(&dir, e))?;
                        if !written.contains(&parent.join(child.file_name())) {
                            remove_any(&child.path()).map_err(|e| StrataError::io(child.path(), e))?;
                        }
                    }
                }
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                if hidden.is_empty() || hidden == "." || hidden == ".." || hidden.contains('/') {
                    return Err(StrataError::Unpack {
                        entry: rel.display().to_string(),
                        message: "whiteout names no entry".into(),
                    });
                }
                if let Some(dir) = resolve_parent(&root, &parent, &rel)? {
                    let victim = dir.join(hidden);
                    remove_any(&victim).map_err(|e| StrataError::io(&victim, e))?;
                }
                continue;
            }

            let dest = target.join(&rel);
            let entry_type = entry.header().entry_type();
            if let Some(dir) = resolve_parent(&root, &parent, &rel)? {
                let existing = dir.join(&name);
                if let Ok(meta) = fs::symlink_metadata(&existing) {
                    // A directory cannot be overwritten in place by a file
                    // and vice versa.
                    if meta.is_dir() != entry_type.is_dir() {
                        remove_any(&existing).map_err(|e| StrataError::io(&existing, e))?;
                    }
                }
            }

            let unpacked = entry
                .unpack_in(target)
                .map_err(|e| archive_error(target, e))?;
            if !unpacked {
                return Err(StrataError::Unpack {
                    entry: rel.display().to_string(),
                    message: "path escapes the layer root".into(),
                });
            }

            if remap {
                let header = entry.header();
                let uid = header.uid().map_err(|e| archive_error(target, e))?;
                let gid = header.gid().map_err(|e| archive_error(target, e))?;
                let uid = map_owner(&rel, uid, spec.uid_mappings, "uid")?;
                let gid = map_owner(&rel, gid, spec.gid_mappings, "gid")?;
                std::os::unix::fs::lchown(&dest, Some(uid), Some(gid))
                    .map_err(|e| StrataError::io(&dest, e))?;
            }

            let _ = written.insert(rel);
            entries += 1;
        }

        tracing::debug!(path = %target.display(), entries, "layer unpacked");
        Ok(())
    }
}
