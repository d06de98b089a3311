//! Filesystem primitives behind every transport
//!
//! All paths are relative to a tree root and must stay inside it.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Attempts at recreating a parent directory pruned by a concurrent delete
const PARENT_ATTEMPTS: usize = 3;

/// Join a relative path onto `root`, refusing anything that escapes it
///
/// # Errors
/// Returns `InvalidInput` for absolute paths or `..` components
pub fn resolve(root: &Path, rel: &Path) -> io::Result<PathBuf> {
    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("path escapes tree root: {}", rel.display()),
                ));
            }
        }
    }
    if depth == 0 {
        return Err(io::Error::new(ErrorKind::InvalidInput, "empty path"));
    }
    Ok(out)
}

fn exists(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run `op` after making sure `target`'s parent exists, recreating it if a
/// concurrent prune removed it in between
fn with_parent<T>(target: &Path, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 0;
    loop {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match op() {
            Err(e) if e.kind() == ErrorKind::NotFound && attempt + 1 < PARENT_ATTEMPTS => {
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Remove empty directories from `path`'s parent up to (not including) `root`
fn prune_empty_parents(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        if fs::remove_dir(current).is_err() {
            break;
        }
        debug!("Pruned empty directory {}", current.display());
        dir = current.parent();
    }
}

/// Rename within the tree. A missing source with an existing destination
/// counts as already done.
///
/// # Errors
/// Fails if the source is missing and the destination absent, or on I/O errors
pub fn move_file(root: &Path, src: &Path, dst: &Path) -> io::Result<()> {
    let from = resolve(root, src)?;
    let to = resolve(root, dst)?;

    if !exists(&from)? {
        if exists(&to)? {
            debug!("Move {} -> {} already applied", src.display(), dst.display());
            return Ok(());
        }
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("move source missing: {}", src.display()),
        ));
    }

    with_parent(&to, || fs::rename(&from, &to))?;
    prune_empty_parents(root, &from);
    Ok(())
}

/// Copy within the tree, replacing the destination atomically
///
/// # Errors
/// Fails if the source is missing or on I/O errors
pub fn copy_file(root: &Path, src: &Path, dst: &Path) -> io::Result<()> {
    let from = resolve(root, src)?;
    let to = resolve(root, dst)?;
    let staging = partial_path(&to);

    with_parent(&to, || fs::copy(&from, &staging).map(|_| ()))?;
    finish(&staging, &to)
}

/// Write `data` to a file in the tree, replacing it atomically
///
/// # Errors
/// Fails on I/O errors
pub fn write_file(root: &Path, dst: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let to = resolve(root, dst)?;
    let staging = partial_path(&to);

    with_parent(&to, || fs::write(&staging, data))?;
    if let Err(e) = set_mode(&staging, mode) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    finish(&staging, &to)
}

/// Delete a file from the tree. A missing file counts as already deleted.
///
/// # Errors
/// Fails on I/O errors other than `NotFound`
pub fn delete_file(root: &Path, path: &Path) -> io::Result<()> {
    let target = resolve(root, path)?;
    match fs::remove_file(&target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Delete {} already applied", path.display());
        }
        Err(e) => return Err(e),
    }
    prune_empty_parents(root, &target);
    Ok(())
}

/// Hidden sibling a file is assembled in before being renamed into place
fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.dirdiff-partial-{}", uuid::Uuid::new_v4()))
}

fn finish(staging: &Path, target: &Path) -> io::Result<()> {
    if let Err(e) = fs::rename(staging, target) {
        let _ = fs::remove_file(staging);
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms)
}
