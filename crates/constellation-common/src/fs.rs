//! Filesystem helpers shared by the workspace, cache, and state files

use std::path::Path;

use crate::{Error, Result};

/// Write `contents` to `path` by writing a sibling temp file and renaming it
///
/// Readers never observe a partially written file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| Error::io("atomic_write", parent, e))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| {
            Error::internal_with_context(
                "atomic_write",
                format!("{} has no file name", path.display()),
            )
        })?
        .to_string_lossy();
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));

    std::fs::write(&tmp, contents).map_err(|e| Error::io("atomic_write", &tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::io("atomic_write", path, e));
    }
    Ok(())
}

/// Recursively copy the directory `from` into a new directory `to`
///
/// Fails if `to` already exists.
pub fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Err(Error::internal_with_context(
            "copy_dir",
            format!("destination {} already exists", to.display()),
        ));
    }
    std::fs::create_dir_all(to).map_err(|e| Error::io("copy_dir", to, e))?;
    copy_dir_contents(from, to)
}

/// Recursively copy the contents of `from` into the existing directory `to`
pub fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    let entries = std::fs::read_dir(from).map_err(|e| Error::io("copy_dir", from, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("copy_dir", from, e))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::io("copy_dir", &src, e))?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&dst).map_err(|e| Error::io("copy_dir", &dst, e))?;
            copy_dir_contents(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst).map_err(|e| Error::io("copy_dir", &src, e))?;
        }
    }
    Ok(())
}

/// Remove a directory tree; a missing directory is not an error
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("remove_dir", path, e)),
    }
}

/// Remove a file; a missing file is not an error
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("remove_file", path, e)),
    }
}
