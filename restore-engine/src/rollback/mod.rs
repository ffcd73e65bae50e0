//! The rollback capsule.
//!
//! A single-slot directory holding everything needed to undo the last
//! restore:
//!
//! ```text
//! <capsule>/
//!   capsule.json        manifest
//!   newpkgs             packages the restore installed
//!   fsdelta             change set that was applied
//!   dirindex            snapshot of the touched paths before the restore
//!   etc/                passwd, group
//!   etc/<db-engine>/    database credentials
//!   overlay/            displaced file contents, at their logical paths
//!   myfs/               database export taken before the import
//! ```
//!
//! Creating a capsule destroys the previous one. Nothing here applies a
//! capsule; it is left on disk for an explicit rollback.

pub mod manifest;

pub use manifest::{FailedCapture, Manifest};

use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::changes::ChangeSet;
use crate::fs::ops::{move_path, remove_any};
use crate::fs::{is_gone, rooted};
use crate::snapshot::{self, Snapshot};
use crate::utils::errors::{CaptureError, Result};

const MANIFEST_FILE: &str = "capsule.json";
const PACKAGES_FILE: &str = "newpkgs";
const CHANGES_FILE: &str = "fsdelta";
const SNAPSHOT_FILE: &str = "dirindex";
const ETC_DIR: &str = "etc";
const OVERLAY_DIR: &str = "overlay";
const DATABASE_DIR: &str = "myfs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Moved into the capsule at this location
    Captured(PathBuf),
    /// An earlier capture of the same path is kept
    AlreadyCaptured,
}

#[derive(Debug)]
pub struct Capsule {
    path: PathBuf,
    db_engine: String,
    captured: HashSet<String>,
    manifest: Manifest,
}

impl Capsule {
    /// Wipe whatever is at `at` and lay out an empty capsule
    pub fn create(at: &Path, db_engine: &str) -> Result<Self> {
        if remove_any(at)? {
            info!("Removed previous rollback capsule at {}", at.display());
        }

        for dir in [
            at.to_path_buf(),
            at.join(ETC_DIR),
            at.join(ETC_DIR).join(db_engine),
            at.join(OVERLAY_DIR),
            at.join(DATABASE_DIR),
        ] {
            fs::create_dir_all(&dir)?;
        }
        fs::set_permissions(at, fs::Permissions::from_mode(0o700))?;

        let capsule = Self {
            path: at.to_path_buf(),
            db_engine: db_engine.to_string(),
            captured: HashSet::new(),
            manifest: Manifest::new(db_engine),
        };
        capsule.save_manifest()?;

        debug!("Created rollback capsule {}", at.display());
        Ok(capsule)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.path.join(OVERLAY_DIR)
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.path.join(ETC_DIR)
    }

    /// Slot for the pre-restore database export
    pub fn database_dir(&self) -> PathBuf {
        self.path.join(DATABASE_DIR)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn is_captured(&self, logical: &str) -> bool {
        self.captured.contains(logical)
    }

    /// Move the live content of `logical` (found at `live`) into the capsule
    /// overlay before it is destroyed. The first capture of a path wins.
    pub fn capture(
        &mut self,
        logical: &str,
        live: &Path,
    ) -> std::result::Result<CaptureOutcome, CaptureError> {
        if self.captured.contains(logical) {
            return Ok(CaptureOutcome::AlreadyCaptured);
        }

        match fs::symlink_metadata(live) {
            Ok(_) => {}
            Err(e) if is_gone(&e) => {
                return Err(CaptureError::Missing(logical.to_string()))
            }
            Err(source) => {
                return Err(CaptureError::Io {
                    path: logical.to_string(),
                    source,
                })
            }
        }

        let dest = rooted(&self.overlay_dir(), logical);
        let io_error = |source| CaptureError::Io {
            path: logical.to_string(),
            source,
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        remove_any(&dest).map_err(io_error)?;
        move_path(live, &dest).map_err(io_error)?;

        self.captured.insert(logical.to_string());
        self.manifest.captured.push(logical.to_string());
        Ok(CaptureOutcome::Captured(dest))
    }

    /// Note a capture that could not be taken
    pub fn record_failure(&mut self, error: &CaptureError) {
        warn!("Rollback capture failed: {}", error);
        self.manifest.failed.push(FailedCapture {
            path: error.path().to_string(),
            reason: error.to_string(),
        });
    }

    pub fn save_packages(&self, packages: &[String]) -> io::Result<()> {
        let mut content = packages.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(self.path.join(PACKAGES_FILE), content)
    }

    pub fn save_changes(&self, changes: &ChangeSet) -> io::Result<()> {
        changes.write_file(&self.path.join(CHANGES_FILE))
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> io::Result<()> {
        snapshot::write_file(&self.path.join(SNAPSHOT_FILE), snapshot)
    }

    /// Copy a live `/etc` file (e.g. passwd) into the capsule
    pub fn save_etc_file(&self, live: &Path) -> io::Result<()> {
        let name = file_name(live)?;
        fs::copy(live, self.etc_dir().join(name))?;
        Ok(())
    }

    /// Copy the live database credentials into `etc/<db-engine>/`
    pub fn save_db_credentials(&self, live: &Path) -> io::Result<()> {
        let name = file_name(live)?;
        fs::copy(live, self.etc_dir().join(&self.db_engine).join(name))?;
        Ok(())
    }

    pub fn save_manifest(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.manifest)?;
        fs::write(self.path.join(MANIFEST_FILE), json)?;
        Ok(())
    }
}

fn file_name(path: &Path) -> io::Result<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })
}
