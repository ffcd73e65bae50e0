//! The restore engine.
//!
//! A restore runs up to three phases in order, each independently skippable:
//!
//! 1. packages: install the packages the backup recorded as new
//! 2. files: merge users and groups, apply the staged overlay, fix
//!    ownership and permissions, apply deletions
//! 3. database: import the backed-up database export
//!
//! With a rollback [`Capsule`], everything a phase is about to destroy is
//! captured into it first.
//!
//! Package failures only produce warnings. In the files phase, per-path
//! failures are reported and the phase continues, but a failed identity
//! merge aborts the restore. Database export and import failures abort.

pub mod overlay;
pub mod session;
pub mod transcript;

pub use overlay::OverlayApplier;
pub use session::{restore, restore_with, RestoreRequest};
pub use transcript::Transcript;

use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::changes::ChangeSet;
use crate::external::{DatabaseTool, DbObject, PackageManager};
use crate::fs::{depth, lstat, rooted};
use crate::limits::{DbNamespace, Limits};
use crate::rollback::Capsule;
use crate::snapshot::Snapshot;
use crate::userdb::{self, IdMap, MergedIdentities};
use crate::utils::errors::{
    CaptureError, DatabaseRestoreError, IdentityMergeError, PackageInstallError, RestoreError,
    Result,
};

const PASSWD: &str = "/etc/passwd";
const GROUP: &str = "/etc/group";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestorePhase {
    Idle,
    PackagesRestoring,
    FilesRestoring,
    DatabaseRestoring,
    Done,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Live filesystem root
    pub root: PathBuf,
    pub skip_packages: bool,
    pub skip_files: bool,
    pub skip_database: bool,
    pub limits: Limits,
}

impl RestoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skip_packages: false,
            skip_files: false,
            skip_database: false,
            limits: Limits::default(),
        }
    }
}

/// Backup metadata carried beside the overlay
///
/// ```text
/// newpkgs             packages installed since the base image
/// fsdelta             change set
/// etc/passwd, etc/group
/// etc/<engine>/       database credentials
/// myfs/               database export
/// ```
#[derive(Debug, Clone)]
pub struct Extras {
    root: PathBuf,
}

impl Extras {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn newpkgs(&self) -> PathBuf {
        self.root.join("newpkgs")
    }

    pub fn fsdelta(&self) -> PathBuf {
        self.root.join("fsdelta")
    }

    pub fn etc(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn passwd(&self) -> PathBuf {
        self.etc().join("passwd")
    }

    pub fn group(&self) -> PathBuf {
        self.etc().join("group")
    }

    pub fn myfs(&self) -> PathBuf {
        self.root.join("myfs")
    }

    /// Backed-up copy of a database credentials file
    pub fn db_credentials(&self, engine: &str, live: &Path) -> Option<PathBuf> {
        let name = live.file_name()?;
        Some(self.etc().join(engine).join(name))
    }
}

/// What a restore did, phase by phase
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Every phase entered, ending in `Done` or `Aborted`
    pub phases: Vec<RestorePhase>,
    pub packages_installed: Vec<String>,
    /// Logical paths replaced from the overlay
    pub applied: Vec<String>,
    pub overlay_errors: Vec<String>,
    pub capture_failures: Vec<String>,
    pub uidmap: IdMap,
    pub gidmap: IdMap,
    /// Transcript lines of the ownership/permission fixes
    pub statfixes: Vec<String>,
    /// Logical paths removed (or captured) as deleted
    pub deleted: Vec<String>,
    pub db_objects: Vec<DbObject>,
    pub warnings: Vec<String>,
}

pub struct RestoreEngine<'a, W: Write> {
    options: RestoreOptions,
    overlay: PathBuf,
    extras: Extras,
    capsule: Option<Capsule>,
    packages: &'a dyn PackageManager,
    database: &'a dyn DatabaseTool,
    transcript: Transcript<W>,
    phase: RestorePhase,
    report: RestoreReport,
}

impl<'a, W: Write> RestoreEngine<'a, W> {
    pub fn new(
        options: RestoreOptions,
        overlay: &Path,
        extras: Extras,
        packages: &'a dyn PackageManager,
        database: &'a dyn DatabaseTool,
        out: W,
    ) -> Self {
        Self {
            options,
            overlay: overlay.to_path_buf(),
            extras,
            capsule: None,
            packages,
            database,
            transcript: Transcript::new(out),
            phase: RestorePhase::Idle,
            report: RestoreReport::default(),
        }
    }

    /// Capture everything the restore destroys into `capsule`
    pub fn with_capsule(mut self, capsule: Capsule) -> Self {
        self.capsule = Some(capsule);
        self
    }

    pub fn phase(&self) -> RestorePhase {
        self.phase
    }

    pub fn report(&self) -> &RestoreReport {
        &self.report
    }

    pub fn capsule(&self) -> Option<&Capsule> {
        self.capsule.as_ref()
    }

    /// Consume the engine, returning the transcript writer
    pub fn into_output(self) -> W {
        self.transcript.into_inner()
    }

    /// Run every phase not skipped. An engine runs once.
    pub fn run(&mut self) -> Result<()> {
        if self.phase != RestorePhase::Idle {
            return Err(RestoreError::Config(format!(
                "restore already ran (state {:?})",
                self.phase
            )));
        }

        let result = self.run_phases();

        if let Some(capsule) = &self.capsule {
            if let Err(e) = capsule.save_manifest() {
                warn!("Failed to save rollback manifest: {}", e);
            }
        }
        self.transcript.flush();

        match result {
            Ok(()) => {
                self.enter(RestorePhase::Done);
                info!("Restore complete");
                Ok(())
            }
            Err(e) => {
                error!("Restore aborted during {:?}: {}", self.phase, e);
                self.enter(RestorePhase::Aborted);
                Err(e)
            }
        }
    }

    fn run_phases(&mut self) -> Result<()> {
        if !self.options.skip_packages {
            self.enter(RestorePhase::PackagesRestoring);
            self.restore_packages();
        }

        if !self.options.skip_files {
            self.enter(RestorePhase::FilesRestoring);
            self.restore_files()?;
        }

        if !self.options.skip_database {
            self.enter(RestorePhase::DatabaseRestoring);
            self.restore_database()?;
        }

        Ok(())
    }

    fn enter(&mut self, phase: RestorePhase) {
        debug!("Restore state {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.report.phases.push(phase);
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.transcript.line(format!("# WARNING: {}", message));
        self.report.warnings.push(message);
    }

    fn restore_packages(&mut self) {
        self.transcript.section("Restoring new packages");

        let packages = match read_package_list(&self.extras.newpkgs()) {
            Ok(packages) => packages,
            Err(e) => {
                self.warn(format!("cannot read package list: {}", e));
                return;
            }
        };

        // Refresh first, otherwise the installer may skip everything
        match self.packages.refresh() {
            Ok(output) => self.transcript.output(&output),
            Err(e) => self.warn(format!("package index refresh failed: {}", e)),
        }

        let plan = match self.packages.plan(&packages) {
            Ok(plan) => plan,
            Err(e) => {
                self.warn(format!("cannot plan package install: {}", e));
                return;
            }
        };

        let saved = self
            .capsule
            .as_ref()
            .map(|capsule| capsule.save_packages(&plan.installable));
        if let Some(Err(e)) = saved {
            self.warn(format!("cannot save package list to rollback: {}", e));
        }

        if !plan.skipping.is_empty() {
            self.transcript
                .line(format!("SKIPPING: {}", plan.skipping.join(" ")));
            self.transcript.blank();
        }

        if plan.installable.is_empty() {
            self.transcript.line("NO NEW INSTALLABLE PACKAGES");
            return;
        }

        self.transcript
            .line(self.packages.install_command(&plan.installable));

        match self.packages.install(&plan.installable) {
            Ok(output) => {
                self.transcript.output(&output);
                info!("Installed {} packages", plan.installable.len());
                self.report.packages_installed = plan.installable;
            }
            Err(PackageInstallError::ExitStatus { code, output }) => {
                self.transcript.output(&output);
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                self.warn(format!("non-zero exitcode ({})", code));
            }
            Err(e) => self.warn(e.to_string()),
        }
    }

    fn restore_files(&mut self) -> Result<()> {
        self.transcript.section("Restoring filesystem");
        let root = self.options.root.clone();

        let merged = self.merge_identities(&root)?;

        let filter = self.options.limits.fs();
        let fsdelta = self.extras.fsdelta();
        let changes = if fsdelta.exists() {
            ChangeSet::read_file(&fsdelta, Some(&filter))?
        } else {
            debug!("No change set at {}", fsdelta.display());
            ChangeSet::default()
        };

        if let Some(capsule) = &self.capsule {
            capsule.save_etc_file(&rooted(&root, PASSWD))?;
            capsule.save_etc_file(&rooted(&root, GROUP))?;
            capsule.save_changes(&changes)?;
            capsule.save_snapshot(&Snapshot::from_paths(&root, changes.paths()))?;
        }
        self.capture_overlaid(&root, &changes);

        self.transcript.blank();
        self.transcript.line("APPLY OVERLAY");
        self.transcript.blank();
        for result in OverlayApplier::new(&self.overlay, &root, &filter) {
            match result {
                Ok(path) => {
                    self.transcript.line(&path);
                    self.report.applied.push(path);
                }
                Err(e) => {
                    warn!("{}", e);
                    self.transcript.line(&e);
                    self.report.overlay_errors.push(e.to_string());
                }
            }
        }

        self.transcript.blank();
        self.transcript.line("APPLYING POST-OVERLAY FIXES");
        self.transcript.blank();
        for action in changes.statfixes(&root, &merged.uidmap, &merged.gidmap) {
            self.transcript.line(&action);
            self.report.statfixes.push(action.to_string());
            if let Err(e) = action.apply(&root) {
                self.warn(format!("{}: {}", action, e));
            }
        }

        self.apply_deletes(&root, &changes);

        merged.passwd.write(&rooted(&root, PASSWD))?;
        merged.group.write(&rooted(&root, GROUP))?;
        self.report.uidmap = merged.uidmap;
        self.report.gidmap = merged.gidmap;

        info!(
            "Files restored: {} applied, {} overlay errors",
            self.report.applied.len(),
            self.report.overlay_errors.len()
        );
        Ok(())
    }

    fn merge_identities(&mut self, root: &Path) -> Result<MergedIdentities> {
        let read = |path: PathBuf| {
            fs::read_to_string(&path).map_err(|source| IdentityMergeError::Io { path, source })
        };

        let merged = userdb::merge(
            &read(self.extras.passwd())?,
            &read(self.extras.group())?,
            &read(rooted(root, PASSWD))?,
            &read(rooted(root, GROUP))?,
        )?;

        self.transcript.line("MERGING USERS AND GROUPS");
        self.transcript.blank();
        for (label, map) in [("UID", &merged.uidmap), ("GID", &merged.gidmap)] {
            let mut pairs: Vec<_> = map.iter().filter(|(old, new)| old != new).collect();
            pairs.sort();
            for (old, new) in pairs {
                self.transcript.line(format!("  {} {} => {}", label, old, new));
            }
        }
        Ok(merged)
    }

    /// Move the live content of every path the overlay replaces into the
    /// capsule. Paths already gone (an ancestor was captured) are skipped;
    /// any other lstat failure is recorded as a capture failure.
    fn capture_overlaid(&mut self, root: &Path, changes: &ChangeSet) {
        let Some(capsule) = self.capsule.as_mut() else {
            return;
        };

        let mut failures = Vec::new();
        for path in changes.overlays() {
            let live = rooted(root, path);
            let captured = match lstat(root, path) {
                Ok(None) => continue,
                Ok(Some(_)) => capsule.capture(path, &live).map(|_| ()),
                Err(source) => Err(CaptureError::Io {
                    path: path.to_string(),
                    source,
                }),
            };
            if let Err(e) = captured {
                capsule.record_failure(&e);
                failures.push(e.to_string());
            }
        }

        for failure in failures {
            self.transcript
                .line(format!("# ROLLBACK CAPTURE FAILED: {}", failure));
            self.report.capture_failures.push(failure);
        }
    }

    /// Remove deleted paths, or with a capsule, move them into it.
    ///
    /// Captures run shallowest first so a directory is captured whole and
    /// its already-moved children are not captured again.
    fn apply_deletes(&mut self, root: &Path, changes: &ChangeSet) {
        let mut actions = changes.deleted(root);
        if self.capsule.is_some() {
            actions.sort_by(|a, b| {
                depth(a.path())
                    .cmp(&depth(b.path()))
                    .then_with(|| a.path().cmp(b.path()))
            });
        }

        for action in actions {
            let path = action.path().to_string();
            let live = rooted(root, &path);
            match lstat(root, &path) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    self.warn(format!("{}: {}", action, e));
                    continue;
                }
            }

            self.transcript.line(&action);
            match self.capsule.as_mut() {
                Some(capsule) => match capsule.capture(&path, &live) {
                    Ok(_) => self.report.deleted.push(path),
                    Err(e) => {
                        capsule.record_failure(&e);
                        self.transcript
                            .line(format!("# ROLLBACK CAPTURE FAILED: {}", e));
                        self.report.capture_failures.push(e.to_string());
                    }
                },
                None => match action.apply(root) {
                    Ok(()) => self.report.deleted.push(path),
                    Err(e) => self.warn(format!("{}: {}", action, e)),
                },
            }
        }
    }

    fn restore_database(&mut self) -> Result<()> {
        self.transcript.section("Restoring databases");
        let database = self.database;
        let engine = database.engine().to_string();

        if let Some(capsule) = &self.capsule {
            database.export(&capsule.database_dir())?;
            let live = database.credentials();
            if live.exists() {
                capsule.save_db_credentials(live).map_err(|source| {
                    DatabaseRestoreError::Credentials {
                        path: live.to_path_buf(),
                        source,
                    }
                })?;
            }
        }

        let filter = DbNamespace::from_engine(&engine)
            .map(|ns| self.options.limits.db(ns))
            .unwrap_or_default();

        let myfs = self.extras.myfs();
        if myfs.is_dir() {
            let mut objects = Vec::new();
            let transcript = &mut self.transcript;
            database.import(&myfs, &filter, &mut |object| {
                transcript.line(object);
                objects.push(object.clone());
            })?;
            info!("Imported {} database objects", objects.len());
            self.report.db_objects = objects;
        } else {
            self.warn(format!("no database export in backup at {}", myfs.display()));
        }

        let live = database.credentials();
        match self.extras.db_credentials(&engine, live) {
            Some(backed_up) if backed_up.is_file() => {
                fs::copy(&backed_up, live).map_err(|source| {
                    DatabaseRestoreError::Credentials {
                        path: live.to_path_buf(),
                        source,
                    }
                })?;
            }
            _ => self.warn(format!(
                "no backed-up credentials for {}, keeping live {}",
                engine,
                live.display()
            )),
        }

        if let Err(e) = database.reload() {
            self.warn(e.to_string());
        }
        Ok(())
    }
}

/// One package per line; a missing file is an empty list
fn read_package_list(path: &Path) -> io::Result<Vec<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_package_list() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("newpkgs");
        assert!(read_package_list(&path)?.is_empty());

        fs::write(&path, "nginx\n\n  php-fpm \n")?;
        assert_eq!(read_package_list(&path)?, vec!["nginx", "php-fpm"]);
        Ok(())
    }

    #[test]
    fn test_extras_layout() {
        let extras = Extras::new("/tmp/extras");
        assert_eq!(extras.passwd(), PathBuf::from("/tmp/extras/etc/passwd"));
        assert_eq!(extras.myfs(), PathBuf::from("/tmp/extras/myfs"));
        assert_eq!(
            extras.db_credentials("mysql", Path::new("/etc/mysql/debian.cnf")),
            Some(PathBuf::from("/tmp/extras/etc/mysql/debian.cnf"))
        );
    }
}
