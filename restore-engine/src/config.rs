//! Configuration management for the restore engine.
//!
//! Loads configuration from a TOML file. Every field has a default, so a
//! partial file (or none at all) is valid; command line flags override.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::errors::{RestoreError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Filesystem the restore is applied to
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Rollback capsule location (single slot)
    #[serde(default = "default_rollback_dir")]
    pub rollback_dir: PathBuf,

    /// Limits applied to every restore, one per line
    #[serde(default = "default_overrides")]
    pub overrides: PathBuf,

    /// Directory of `restore pre`/`restore post` hooks
    #[serde(default = "default_hooks_dir")]
    pub hooks_dir: PathBuf,

    #[serde(default)]
    pub skip_files: bool,

    #[serde(default)]
    pub skip_database: bool,

    #[serde(default)]
    pub skip_packages: bool,

    /// Do not capture rollback data
    #[serde(default)]
    pub no_rollback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database engine (mysql)
    #[serde(default = "default_db_engine")]
    pub engine: String,

    /// Maintenance credentials file, also carried in the backup
    #[serde(default = "default_db_credentials")]
    pub credentials: PathBuf,

    /// Server PID file, signalled to reload after a restore
    #[serde(default = "default_db_pid_file")]
    pub pid_file: PathBuf,

    #[serde(default = "default_db_client")]
    pub client: String,

    #[serde(default = "default_db_dump")]
    pub dump: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagesConfig {
    #[serde(default = "default_apt_get")]
    pub apt_get: String,

    #[serde(default = "default_apt_cache")]
    pub apt_cache: String,

    #[serde(default = "default_dpkg_query")]
    pub dpkg_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive retrieval command
    #[serde(default = "default_archive_command")]
    pub command: String,

    /// Directory inside the archive holding backup metadata
    #[serde(default = "default_extras_dir")]
    pub extras_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_rollback_dir() -> PathBuf {
    PathBuf::from("/var/backups/tklbam-rollback")
}

fn default_overrides() -> PathBuf {
    PathBuf::from("/etc/tklbam/overrides")
}

fn default_hooks_dir() -> PathBuf {
    PathBuf::from("/etc/tklbam/hooks.d")
}

fn default_db_engine() -> String {
    "mysql".to_string()
}

fn default_db_credentials() -> PathBuf {
    PathBuf::from("/etc/mysql/debian.cnf")
}

fn default_db_pid_file() -> PathBuf {
    PathBuf::from("/var/run/mysqld/mysqld.pid")
}

fn default_db_client() -> String {
    "mysql".to_string()
}

fn default_db_dump() -> String {
    "mysqldump".to_string()
}

fn default_apt_get() -> String {
    "apt-get".to_string()
}

fn default_apt_cache() -> String {
    "apt-cache".to_string()
}

fn default_dpkg_query() -> String {
    "dpkg-query".to_string()
}

fn default_archive_command() -> String {
    "duplicity".to_string()
}

fn default_extras_dir() -> String {
    "TKLBAM".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            rollback_dir: default_rollback_dir(),
            overrides: default_overrides(),
            hooks_dir: default_hooks_dir(),
            skip_files: false,
            skip_database: false,
            skip_packages: false,
            no_rollback: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: default_db_engine(),
            credentials: default_db_credentials(),
            pid_file: default_db_pid_file(),
            client: default_db_client(),
            dump: default_db_dump(),
        }
    }
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            apt_get: default_apt_get(),
            apt_cache: default_apt_cache(),
            dpkg_query: default_dpkg_query(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            command: default_archive_command(),
            extras_dir: default_extras_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| RestoreError::Config(format!("{}: {}", path.display(), e)))
    }
}
