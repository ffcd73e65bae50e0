//! One restore, from archive address to finished engine run.
//!
//! Fetches the archive into a private staging directory, splits the extras
//! out of the overlay, runs the hooks around the engine and cleans up the
//! staging directories however the run ends.

use nix::unistd::geteuid;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{Extras, RestoreEngine, RestoreOptions, RestoreReport, Transcript};
use crate::config::{Config, DatabaseConfig};
use crate::external::{
    AptPackageManager, ArchiveSource, DatabaseTool, DuplicityArchive, MySqlTool, PackageManager,
};
use crate::fs::ops::move_path;
use crate::hooks::{HookStage, Hooks};
use crate::limits::{DbNamespace, Limits};
use crate::rollback::Capsule;
use crate::utils::errors::{ArchiveRetrievalError, RestoreError, Result};
use crate::utils::lock::RestoreLock;

/// Command line side of a restore; config supplies the rest
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub address: String,
    pub keyfile: PathBuf,
    pub limits: Vec<String>,
    pub skip_files: bool,
    pub skip_database: bool,
    pub skip_packages: bool,
    pub no_rollback: bool,
}

/// Restore with the real tools, transcript on stdout
pub fn restore(config: &Config, request: &RestoreRequest) -> Result<RestoreReport> {
    let archive = DuplicityArchive::new(config.archive.command.as_str());
    let packages = AptPackageManager::new(
        config.packages.apt_get.as_str(),
        config.packages.apt_cache.as_str(),
        config.packages.dpkg_query.as_str(),
    );
    let database = database_tool(&config.database)?;

    restore_with(config, request, &archive, &packages, &database, io::stdout())
}

/// The tool for the configured database engine
pub fn database_tool(config: &DatabaseConfig) -> Result<MySqlTool> {
    match config.engine.as_str() {
        "mysql" => Ok(MySqlTool::new(
            config.client.as_str(),
            config.dump.as_str(),
            config.credentials.as_path(),
            config.pid_file.as_path(),
        )),
        other => Err(RestoreError::Config(format!(
            "unsupported database engine {:?}",
            other
        ))),
    }
}

pub fn restore_with<W: Write>(
    config: &Config,
    request: &RestoreRequest,
    archive: &dyn ArchiveSource,
    packages: &dyn PackageManager,
    database: &dyn DatabaseTool,
    mut out: W,
) -> Result<RestoreReport> {
    let root = &config.restore.root;
    if root == Path::new("/") && !geteuid().is_root() {
        return Err(RestoreError::PermissionDenied(
            "restoring onto / requires root privileges".to_string(),
        ));
    }

    let passphrase = read_keyfile(&request.keyfile)?;

    let mut limits = Limits::from_file(&config.restore.overrides)?;
    limits.extend(Limits::parse(&request.limits)?);

    let active = DbNamespace::from_engine(database.engine());
    for namespace in limits.db_namespaces() {
        if Some(namespace) != active {
            warn!(
                "Ignoring {}* limits, the database engine is {}",
                namespace.prefix(),
                database.engine()
            );
        }
    }

    let options = RestoreOptions {
        root: root.clone(),
        skip_packages: request.skip_packages || config.restore.skip_packages,
        skip_files: request.skip_files || config.restore.skip_files,
        skip_database: request.skip_database || config.restore.skip_database,
        limits,
    };
    let no_rollback = request.no_rollback || config.restore.no_rollback;

    let _lock = RestoreLock::acquire(&config.restore.rollback_dir)?;

    let staging = tempfile::Builder::new().prefix("tklbam-").tempdir()?;
    fs::set_permissions(staging.path(), fs::Permissions::from_mode(0o700))?;

    info!("Retrieving backup from {}", request.address);
    archive.fetch(&request.address, &passphrase, staging.path())?;

    let extras_tmp = tempfile::Builder::new().prefix("tklbam-extras-").tempdir()?;
    let extras = split_extras(staging.path(), &config.archive.extras_dir, extras_tmp.path())?;

    let hooks = Hooks::new(&config.restore.hooks_dir);
    hooks.run(HookStage::Pre)?;

    Transcript::new(&mut out).banner("Restore started");

    let mut engine = RestoreEngine::new(
        options,
        staging.path(),
        extras,
        packages,
        database,
        &mut out,
    );
    if !no_rollback {
        let capsule = Capsule::create(&config.restore.rollback_dir, database.engine())?;
        info!("Rollback capsule at {}", capsule.path().display());
        engine = engine.with_capsule(capsule);
    }

    engine.run()?;
    let report = engine.report().clone();

    hooks.run(HookStage::Post)?;
    Ok(report)
}

fn read_keyfile(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).map_err(|source| ArchiveRetrievalError::KeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content.trim().to_string())
}

/// Move the extras directory out of the staged archive so the rest of it
/// is a pure overlay
fn split_extras(staging: &Path, name: &str, into: &Path) -> Result<Extras> {
    let source = staging.join(name.trim_matches('/'));
    if !source.is_dir() {
        return Err(ArchiveRetrievalError::MissingExtras(source).into());
    }

    let dest = into.join("extras");
    move_path(&source, &dest)?;
    Ok(Extras::new(dest))
}
