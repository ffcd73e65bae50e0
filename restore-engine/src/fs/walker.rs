//! Directory traversal of the live filesystem in logical path terms.
//!
//! Used to build snapshots of the live state. Filtering by limits happens per
//! entry rather than by pruning directories, because a longer include limit
//! can re-admit paths below an excluded directory.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{is_gone, logical, rooted};
use crate::limits::PathFilter;

/// A path discovered during walking
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Physical path on disk
    pub path: PathBuf,

    /// Absolute logical path (relative to the walk root)
    pub logical: String,
}

/// Walk `logical_start` under `root` without following symlinks, calling
/// `callback` for every entry the filter admits, in file name order.
///
/// A missing starting path yields no entries. Entries whose names are not
/// valid UTF-8 are skipped with a warning. The first callback error stops
/// the walk.
pub fn walk_logical<F>(
    root: &Path,
    logical_start: &str,
    filter: &PathFilter,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(WalkEntry) -> std::io::Result<()>,
{
    let start = rooted(root, logical_start);
    match start.symlink_metadata() {
        Ok(_) => {}
        Err(e) if is_gone(&e) => {
            debug!("Walk start {} does not exist, skipping", start.display());
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    for entry in WalkDir::new(&start).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;

        let Some(logical_path) = logical(root, entry.path()) else {
            warn!("Skipping non UTF-8 path {}", entry.path().display());
            continue;
        };

        if !filter.matches(&logical_path) {
            continue;
        }

        callback(WalkEntry {
            path: entry.into_path(),
            logical: logical_path,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn all() -> PathFilter {
        PathFilter::default()
    }

    fn collect(root: &Path, start: &str, filter: &PathFilter) -> std::io::Result<Vec<String>> {
        let mut paths = Vec::new();
        walk_logical(root, start, filter, |entry| {
            paths.push(entry.logical);
            Ok(())
        })?;
        Ok(paths)
    }

    #[test]
    fn test_walk_missing_start() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(collect(temp_dir.path(), "/nope", &all())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_logical_paths() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("etc/sub"))?;
        fs::write(temp_dir.path().join("etc/a"), b"a")?;
        fs::write(temp_dir.path().join("etc/sub/b"), b"b")?;

        assert_eq!(
            collect(temp_dir.path(), "/etc", &all())?,
            vec!["/etc", "/etc/a", "/etc/sub", "/etc/sub/b"]
        );
        Ok(())
    }

    #[test]
    fn test_walk_applies_filter_without_pruning() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("var/log/keep"))?;
        fs::write(temp_dir.path().join("var/log/drop"), b"x")?;
        fs::write(temp_dir.path().join("var/log/keep/file"), b"x")?;

        let filter = PathFilter::new(["-/var/log", "/var/log/keep"]);
        assert_eq!(
            collect(temp_dir.path(), "/var", &filter)?,
            vec!["/var/log/keep", "/var/log/keep/file"]
        );
        Ok(())
    }

    #[test]
    fn test_callback_error_stops_walk() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("etc"))?;
        fs::write(temp_dir.path().join("etc/a"), b"a")?;

        let mut seen = 0;
        let result = walk_logical(temp_dir.path(), "/etc", &all(), |_| {
            seen += 1;
            Err(std::io::Error::other("stop"))
        });
        assert!(result.is_err());
        assert_eq!(seen, 1);
        Ok(())
    }
}
