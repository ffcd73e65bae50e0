//! Filesystem access for restore operations.
//!
//! Snapshots and change sets name files by their absolute *logical* path
//! (`/etc/passwd`). The engine operates on a live tree mounted at a
//! configurable root, normally `/`; these helpers translate between the two.

pub mod metadata;
pub mod ops;
pub mod walker;

use nix::errno::Errno;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Map an absolute logical path onto the filesystem rooted at `root`
pub fn rooted(root: &Path, logical: &str) -> PathBuf {
    root.join(logical.trim_start_matches('/'))
}

/// Logical path of `physical` relative to `base`, or `None` if it lies outside
/// `base` or is not valid UTF-8.
pub fn logical(base: &Path, physical: &Path) -> Option<String> {
    let rel = physical.strip_prefix(base).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => {
                out.push('/');
                out.push_str(name.to_str()?);
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

/// Number of components in a logical path (`/` is 0, `/etc/foo` is 2)
pub fn depth(logical: &str) -> usize {
    logical.split('/').filter(|c| !c.is_empty()).count()
}

/// Whether an error means the path does not exist, including the case where
/// one of its ancestors is no longer a directory
pub fn is_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(Errno::ENOTDIR as i32)
}

/// `lstat` of a logical path under `root`; `None` if it is gone
pub fn lstat(root: &Path, logical: &str) -> io::Result<Option<Metadata>> {
    match std::fs::symlink_metadata(rooted(root, logical)) {
        Ok(m) => Ok(Some(m)),
        Err(e) if is_gone(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rooted() {
        assert_eq!(rooted(Path::new("/"), "/etc/foo"), PathBuf::from("/etc/foo"));
        assert_eq!(
            rooted(Path::new("/mnt/target"), "/etc/foo"),
            PathBuf::from("/mnt/target/etc/foo")
        );
    }

    #[test]
    fn test_logical() {
        let base = Path::new("/mnt/target");
        assert_eq!(
            logical(base, Path::new("/mnt/target/etc/foo")).as_deref(),
            Some("/etc/foo")
        );
        assert_eq!(logical(base, Path::new("/mnt/target")).as_deref(), Some("/"));
        assert_eq!(logical(base, Path::new("/elsewhere")), None);
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth("/etc"), 1);
        assert_eq!(depth("/etc/mysql/debian.cnf"), 3);
    }

    #[test]
    fn test_lstat_below_file_is_gone() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(temp_dir.path().join("app"), b"now a file")?;

        assert!(lstat(temp_dir.path(), "/app")?.is_some());
        assert!(lstat(temp_dir.path(), "/app/data")?.is_none());
        assert!(lstat(temp_dir.path(), "/missing")?.is_none());
        Ok(())
    }
}
