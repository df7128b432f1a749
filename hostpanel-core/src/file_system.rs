//! Filesystem boundary helpers.
//!
//! Paths derived from tenant input are checked with [`ensure_within`] before
//! anything is created, moved or removed. Configuration files are replaced with
//! [`write_atomic`] so readers never observe a half-written file.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::error::{HostError, Result};

/// Lexically normalize an absolute path, resolving `.` and `..` components.
///
/// Returns `None` when the path is relative or `..` would climb above `/`.
fn normalize(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

/// Verify that `candidate` stays inside `root` and return its normalized form.
///
/// The check is lexical first; when both paths exist on disk they are also
/// canonicalized so a symlink cannot be used to escape the root.
pub fn ensure_within(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let root_norm = normalize(root).ok_or_else(|| {
        HostError::Validation(format!("Root path must be absolute: {}", root.display()))
    })?;
    let candidate_norm = normalize(candidate).ok_or_else(|| {
        HostError::Validation(format!(
            "Path must be absolute and normalized: {}",
            candidate.display()
        ))
    })?;

    if !candidate_norm.starts_with(&root_norm) {
        return Err(HostError::Validation(format!(
            "Path {} escapes {}",
            candidate.display(),
            root.display()
        )));
    }

    if let (Ok(real_root), Ok(real_candidate)) =
        (fs::canonicalize(&root_norm), fs::canonicalize(&candidate_norm))
    {
        if !real_candidate.starts_with(&real_root) {
            return Err(HostError::Validation(format!(
                "Path {} resolves outside {}",
                candidate.display(),
                root.display()
            )));
        }
    }

    Ok(candidate_norm)
}

/// Atomically replace `path` with `contents` and apply `mode` (unix only).
///
/// The data is written to a temporary file in the same directory and renamed
/// over the target.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        HostError::Validation(format!("Path has no parent directory: {}", path.display()))
    })?;
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    set_mode(temp.path(), mode)?;
    temp.persist(path).map_err(|e| HostError::Io(e.error))?;
    Ok(())
}

/// Set unix permission bits. No-op on other platforms.
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Read a file, mapping "not found" to `None`.
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, returning whether anything was removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Put back what [`read_if_exists`] returned before a rejected write: the
/// previous bytes, or no file at all.
pub fn restore_file(path: &Path, previous: Option<&[u8]>, mode: u32) -> Result<()> {
    match previous {
        Some(bytes) => write_atomic(path, bytes, mode),
        None => remove_file_if_exists(path).map(|_| ()),
    }
}

/// Path a site root is moved to when the site is deleted.
pub fn archive_path(root: &Path, at: DateTime<Utc>) -> PathBuf {
    let mut name = root.as_os_str().to_os_string();
    name.push(format!("_deleted_{}", at.format("%Y%m%d%H%M%S")));
    PathBuf::from(name)
}

/// Rename `root` to its archive path. Returns the archive location, or `None`
/// when there was nothing to archive.
pub fn archive_dir(root: &Path, at: DateTime<Utc>) -> Result<Option<PathBuf>> {
    if !root.exists() {
        return Ok(None);
    }
    let target = archive_path(root, at);
    if target.exists() {
        return Err(HostError::ResourceCreation(format!(
            "Archive target already exists: {}",
            target.display()
        )));
    }
    fs::rename(root, &target)?;
    Ok(Some(target))
}
