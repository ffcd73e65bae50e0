//! Moving a staged overlay tree onto the live filesystem.
//!
//! The overlay is walked depth first, parents before children. For every
//! directory, a live non-directory standing where it should be is removed.
//! Every file (or symlink) the limits admit then replaces its live
//! counterpart. A failure on one path is reported and the walk moves on.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::fs::ops::{move_path, remove_any};
use crate::fs::{is_gone, logical, rooted};
use crate::limits::PathFilter;
use crate::utils::errors::OverlayApplyError;

/// Iterator over the paths replaced by an overlay, yielding a diagnostic for
/// each path that could not be replaced.
pub struct OverlayApplier<'a> {
    overlay: PathBuf,
    root: PathBuf,
    filter: &'a PathFilter,
    dirs: Vec<PathBuf>,
    files: VecDeque<PathBuf>,
    errors: VecDeque<OverlayApplyError>,
}

impl<'a> OverlayApplier<'a> {
    pub fn new(overlay: &Path, root: &Path, filter: &'a PathFilter) -> Self {
        Self {
            overlay: overlay.to_path_buf(),
            root: root.to_path_buf(),
            filter,
            dirs: vec![overlay.to_path_buf()],
            files: VecDeque::new(),
            errors: VecDeque::new(),
        }
    }

    fn fail(&mut self, path: &str, source: io::Error) {
        self.errors.push_back(OverlayApplyError {
            path: path.to_string(),
            source,
        });
    }

    /// Queue a directory's files and subdirectories, clearing the way for it
    /// on the live side.
    fn visit(&mut self, dir: PathBuf) {
        let Some(dir_logical) = logical(&self.overlay, &dir) else {
            warn!("Skipping non UTF-8 overlay directory {}", dir.display());
            return;
        };

        let entries = match sorted_entries(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.fail(&dir_logical, e);
                return;
            }
        };

        if let Err(e) = self.prepare_live_dir(&dir_logical) {
            self.fail(&dir_logical, e);
        }

        let mut subdirs = Vec::new();
        for path in entries {
            // Symlinks to directories are moved as links, not descended into
            match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => subdirs.push(path),
                Ok(_) => self.files.push_back(path),
                Err(e) => {
                    let name = logical(&self.overlay, &path).unwrap_or_default();
                    self.fail(&name, e);
                }
            }
        }

        // Stack: push in reverse so the first name is visited first
        self.dirs.extend(subdirs.into_iter().rev());
    }

    fn prepare_live_dir(&self, dir_logical: &str) -> io::Result<()> {
        let live = rooted(&self.root, dir_logical);

        match fs::metadata(&live) {
            Ok(m) if m.is_dir() => return Ok(()),
            Ok(_) => {
                debug!("Removing {} to make way for a directory", live.display());
                remove_any(&live)?;
            }
            // Dangling symlinks are left for the per-file step to report
            Err(e) if is_gone(&e) => {
                if fs::symlink_metadata(&live).is_ok() {
                    return Ok(());
                }
            }
            Err(e) => return Err(e),
        }

        if self.filter.matches(dir_logical) {
            fs::create_dir_all(&live)?;
        }
        Ok(())
    }

    /// Replace the live counterpart of one overlay file. `Ok(None)` when the
    /// limits exclude it.
    fn apply(&self, file: &Path) -> Result<Option<String>, OverlayApplyError> {
        let Some(path) = logical(&self.overlay, file) else {
            warn!("Skipping non UTF-8 overlay path {}", file.display());
            return Ok(None);
        };

        if !self.filter.matches(&path) {
            return Ok(None);
        }

        let live = rooted(&self.root, &path);
        let result = remove_any(&live).and_then(|_| {
            if let Some(parent) = live.parent() {
                fs::create_dir_all(parent)?;
            }
            move_path(file, &live)
        });

        match result {
            Ok(()) => Ok(Some(path)),
            Err(source) => Err(OverlayApplyError { path, source }),
        }
    }
}

impl Iterator for OverlayApplier<'_> {
    type Item = Result<String, OverlayApplyError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(error) = self.errors.pop_front() {
                return Some(Err(error));
            }

            if let Some(file) = self.files.pop_front() {
                match self.apply(&file) {
                    Ok(Some(path)) => return Some(Ok(path)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }

            let dir = self.dirs.pop()?;
            self.visit(dir);
        }
    }
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        overlay: PathBuf,
        root: PathBuf,
    }

    fn fixture() -> io::Result<Fixture> {
        let temp_dir = TempDir::new()?;
        let overlay = temp_dir.path().join("overlay");
        let root = temp_dir.path().join("root");
        fs::create_dir_all(&overlay)?;
        fs::create_dir_all(&root)?;
        Ok(Fixture {
            _temp_dir: temp_dir,
            overlay,
            root,
        })
    }

    fn stage(dir: &Path, path: &str, content: &str) -> io::Result<()> {
        let full = dir.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, content)
    }

    #[test]
    fn test_applies_in_walk_order() -> io::Result<()> {
        let f = fixture()?;
        stage(&f.overlay, "var/www/index.html", "new page")?;
        stage(&f.overlay, "etc/app.conf", "new conf")?;
        stage(&f.overlay, "etc/sub/deep", "deep")?;
        stage(&f.root, "etc/app.conf", "old conf")?;

        let filter = PathFilter::default();
        let applied: Vec<String> = OverlayApplier::new(&f.overlay, &f.root, &filter)
            .collect::<Result<_, _>>()
            .map_err(io::Error::other)?;

        assert_eq!(
            applied,
            vec!["/etc/app.conf", "/etc/sub/deep", "/var/www/index.html"]
        );
        assert_eq!(fs::read_to_string(f.root.join("etc/app.conf"))?, "new conf");
        assert_eq!(fs::read_to_string(f.root.join("var/www/index.html"))?, "new page");
        assert!(!f.overlay.join("etc/app.conf").exists());
        Ok(())
    }

    #[test]
    fn test_respects_limits() -> io::Result<()> {
        let f = fixture()?;
        stage(&f.overlay, "etc/keep", "k")?;
        stage(&f.overlay, "var/log/skip", "s")?;

        let filter = PathFilter::new(["-/var/log"]);
        let applied: Vec<_> = OverlayApplier::new(&f.overlay, &f.root, &filter)
            .filter_map(Result::ok)
            .collect();

        assert_eq!(applied, vec!["/etc/keep"]);
        assert!(!f.root.join("var/log/skip").exists());
        assert!(f.overlay.join("var/log/skip").exists());
        Ok(())
    }

    #[test]
    fn test_file_obstructing_directory_is_replaced() -> io::Result<()> {
        let f = fixture()?;
        stage(&f.overlay, "srv/data/file", "payload")?;
        stage(&f.root, "srv", "i am a file")?;

        let filter = PathFilter::default();
        let results: Vec<_> = OverlayApplier::new(&f.overlay, &f.root, &filter).collect();

        assert!(results.iter().all(Result::is_ok));
        assert!(f.root.join("srv").is_dir());
        assert_eq!(fs::read_to_string(f.root.join("srv/data/file"))?, "payload");
        Ok(())
    }

    #[test]
    fn test_partial_failure_continues() -> io::Result<()> {
        let f = fixture()?;
        stage(&f.overlay, "broken/file", "x")?;
        stage(&f.overlay, "ok/file", "y")?;
        // A dangling link where a directory is needed: parent creation fails
        symlink("/nonexistent/target", f.root.join("broken"))?;

        let filter = PathFilter::default();
        let results: Vec<_> = OverlayApplier::new(&f.overlay, &f.root, &filter).collect();

        assert_eq!(results.len(), 2);
        match &results[0] {
            Err(e) => {
                assert_eq!(e.path, "/broken/file");
                assert!(e.to_string().starts_with("OVERLAY ERROR @ /broken/file"));
            }
            Ok(path) => panic!("expected failure, applied {}", path),
        }
        assert_eq!(results[1].as_ref().ok().map(String::as_str), Some("/ok/file"));
        assert_eq!(fs::read_to_string(f.root.join("ok/file"))?, "y");
        Ok(())
    }

    #[test]
    fn test_symlinks_moved_as_links() -> io::Result<()> {
        let f = fixture()?;
        fs::create_dir_all(f.overlay.join("etc"))?;
        symlink("/usr/share/zoneinfo/UTC", f.overlay.join("etc/localtime"))?;

        let filter = PathFilter::default();
        let applied: Vec<_> = OverlayApplier::new(&f.overlay, &f.root, &filter)
            .filter_map(Result::ok)
            .collect();

        assert_eq!(applied, vec!["/etc/localtime"]);
        assert_eq!(
            fs::read_link(f.root.join("etc/localtime"))?,
            PathBuf::from("/usr/share/zoneinfo/UTC")
        );
        Ok(())
    }

    #[test]
    fn test_empty_directories_created() -> io::Result<()> {
        let f = fixture()?;
        fs::create_dir_all(f.overlay.join("var/spool/empty"))?;

        let filter = PathFilter::default();
        assert_eq!(OverlayApplier::new(&f.overlay, &f.root, &filter).count(), 0);
        assert!(f.root.join("var/spool/empty").is_dir());
        Ok(())
    }
}
