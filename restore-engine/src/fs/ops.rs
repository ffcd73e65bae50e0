//! Destructive filesystem primitives used while restoring.
//!
//! `move_path` renames when source and destination share a volume, which is
//! atomic. Across volumes it falls back to copying the tree (preserving
//! symlinks, permissions and ownership) and removing the source.

use nix::errno::Errno;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use super::is_gone;
use super::metadata::set_owner;

/// Remove a path whether it is a file, symlink or directory.
///
/// Returns `Ok(false)` when there was nothing to remove.
pub fn remove_any(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if is_gone(&e) => return Ok(false),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }

    Ok(true)
}

/// Move `src` to `dst`, replacing nothing: `dst` must not exist
pub fn move_path(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            debug!("Cross-device move {} -> {}, copying", src.display(), dst.display());
            copy_tree(src, dst)?;
            remove_any(src)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Recursively copy `src` to `dst` preserving symlinks, modes and ownership
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };

        let metadata = entry.path().symlink_metadata()?;
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_dir() {
            fs::create_dir(&target)?;
            dirs.push((target.clone(), metadata.permissions()));
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot copy special file {}", entry.path().display()),
            ));
        }

        preserve_owner(&target, metadata.uid(), metadata.gid())?;
    }

    // Directory permissions last, so read-only directories can be populated first
    for (dir, perms) in dirs.into_iter().rev() {
        fs::set_permissions(&dir, perms)?;
    }

    Ok(())
}

fn preserve_owner(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    match set_owner(path, uid, gid) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!("Cannot preserve ownership of {}: {}", path.display(), e);
            Ok(())
        }
        other => other,
    }
}
