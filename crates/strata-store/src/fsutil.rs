//! Filesystem helpers shared by the volume driver and the bundler.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use nix::sys::stat::{Mode, SFlag, mknod};
use strata_common::error::{Result, StrataError};

/// Checks that `id` can be used as a single path component.
///
/// Allowed characters are ASCII alphanumerics, `.`, `_`, `-` and any
/// character in `extra`.
///
/// # Errors
///
/// Returns `StrataError::InvalidId` describing the first problem found.
pub fn validate_id(kind: &'static str, id: &str, extra: &[char]) -> Result<()> {
    let invalid = |reason| StrataError::InvalidId {
        kind,
        id: id.to_string(),
        reason,
    };
    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(invalid("must not be a relative path component"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') || extra.contains(&c))
    {
        return Err(invalid("contains invalid characters"));
    }
    Ok(())
}

/// Recursively copies `src` into `dst`, creating `dst`.
///
/// Regular files, directories, symlinks, FIFOs and device nodes are copied
/// with their modes. Ownership is carried over when it differs from the
/// copy's, which needs privileges only when the tree holds files owned by
/// someone else; creating device nodes needs `CAP_MKNOD`. Sockets are
/// skipped.
///
/// # Errors
///
/// Returns `StrataError::Io` naming the path that failed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).map_err(|e| StrataError::io(src, e))?;
    fs::create_dir_all(dst).map_err(|e| StrataError::io(dst, e))?;

    for entry in fs::read_dir(src).map_err(|e| StrataError::io(src, e))? {
        let entry = entry.map_err(|e| StrataError::io(src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let entry_meta = fs::symlink_metadata(&src_path).map_err(|e| StrataError::io(&src_path, e))?;
        let file_type = entry_meta.file_type();

        if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
            continue;
        }
        if file_type.is_symlink() {
            let target = fs::read_link(&src_path).map_err(|e| StrataError::io(&src_path, e))?;
            std::os::unix::fs::symlink(&target, &dst_path)
                .map_err(|e| StrataError::io(&dst_path, e))?;
        } else if file_type.is_file() {
            let _ = fs::copy(&src_path, &dst_path).map_err(|e| StrataError::io(&dst_path, e))?;
        } else if let Some(kind) = node_kind(file_type) {
            copy_node(&entry_meta, kind, &dst_path)?;
        } else {
            tracing::warn!(path = %src_path.display(), "skipping socket");
            continue;
        }
        copy_ownership(&entry_meta, &dst_path)?;
    }

    fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))
        .map_err(|e| StrataError::io(dst, e))?;
    copy_ownership(&meta, dst)
}

fn node_kind(file_type: fs::FileType) -> Option<SFlag> {
    if file_type.is_fifo() {
        Some(SFlag::S_IFIFO)
    } else if file_type.is_char_device() {
        Some(SFlag::S_IFCHR)
    } else if file_type.is_block_device() {
        Some(SFlag::S_IFBLK)
    } else {
        None
    }
}

fn copy_node(src_meta: &fs::Metadata, kind: SFlag, dst: &Path) -> Result<()> {
    let mode = src_meta.mode() & 0o7777;
    mknod(dst, kind, Mode::from_bits_truncate(mode), src_meta.rdev())
        .map_err(|errno| StrataError::io(dst, errno.into()))?;
    // mknod applies the umask.
    fs::set_permissions(dst, fs::Permissions::from_mode(mode)).map_err(|e| StrataError::io(dst, e))
}

fn copy_ownership(src_meta: &fs::Metadata, dst: &Path) -> Result<()> {
    let dst_meta = fs::symlink_metadata(dst).map_err(|e| StrataError::io(dst, e))?;
    if dst_meta.uid() == src_meta.uid() && dst_meta.gid() == src_meta.gid() {
        return Ok(());
    }
    std::os::unix::fs::lchown(dst, Some(src_meta.uid()), Some(src_meta.gid()))
        .map_err(|e| StrataError::io(dst, e))
}

/// Returns the apparent size in bytes of everything under `path`.
///
/// # Errors
///
/// Returns `StrataError::Io` if part of the tree cannot be read.
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path).map_err(|e| StrataError::io(path, e))? {
        let entry = entry.map_err(|e| StrataError::io(path, e))?;
        let meta = fs::symlink_metadata(entry.path()).map_err(|e| StrataError::io(entry.path(), e))?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Lists the names of the directories directly under `path`.
///
/// A missing `path` yields an empty list.
///
/// # Errors
///
/// Returns `StrataError::Io` if the directory cannot be read.
pub fn list_dirs(path: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StrataError::io(path, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StrataError::io(path, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| StrataError::io(entry.path(), e))?
            .is_dir();
        if is_dir {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
