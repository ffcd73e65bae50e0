//! File metadata handling for restore operations.
//!
//! Reads the ownership, permissions, size, timestamp and link target of a
//! live path into a snapshot `Record`, and applies ownership and permission
//! corrections back onto live paths.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use crate::snapshot::Record;

/// File type bits of `st_mode`
pub const S_IFMT: u32 = 0o170000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Permission bits (including setuid, setgid, sticky)
pub const PERM_MASK: u32 = 0o7777;

pub fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Extract a snapshot record from a live path without following symlinks
pub fn read_record(physical: &Path, logical: &str) -> io::Result<Record> {
    let metadata = fs::symlink_metadata(physical)?;

    let symlink = if metadata.file_type().is_symlink() {
        let target = fs::read_link(physical)?;
        Some(target.to_string_lossy().to_string())
    } else {
        None
    };

    Ok(Record {
        path: logical.to_string(),
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        size: metadata.size() as i64,
        mtime: metadata.mtime().max(0) as u64,
        symlink,
    })
}

/// Change ownership of a path without following symlinks
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
}

/// Set permission bits; the file type bits of `mode` are ignored
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & PERM_MASK))
}
