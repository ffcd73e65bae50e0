//! Custom error types for the restore engine.
//!
//! Each failure class of a restore run has its own type so callers can tell
//! recoverable diagnostics (capture, overlay, package) apart from the fatal
//! ones that abort the run. `RestoreError` is the top-level error returned by
//! every fallible operation that can stop a restore.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed snapshot or change-set encoding.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Unknown format magic: {0:?}")]
    UnknownMagic(String),

    #[error("Truncated {what}: need {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: u64,
        available: u64,
    },

    #[error("Meta table length {0} is not a multiple of the 36 byte entry size")]
    MetaTableMisaligned(u64),

    #[error("Entry count mismatch: header declares {declared}, meta table holds {found}")]
    CountMismatch { declared: u64, found: u64 },

    #[error("Path entry at offset {offset} exceeds path table of {size} bytes")]
    PathOffset { offset: u64, size: u64 },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Duplicate path: {0}")]
    DuplicatePath(String),

    #[error("Symlink target recorded for non-symlink mode {mode:o}: {path}")]
    SymlinkMode { path: String, mode: u32 },

    #[error("Line {line}: {reason}")]
    BadLine { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The rollback capsule could not take a copy of a path before it was destroyed.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No such file or directory: {0}")]
    Missing(String),

    #[error("Cannot capture {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    pub fn path(&self) -> &str {
        match self {
            CaptureError::Missing(path) => path,
            CaptureError::Io { path, .. } => path,
        }
    }
}

/// A single path failed to be replaced while applying the overlay.
#[derive(Error, Debug)]
#[error("OVERLAY ERROR @ {path}: {source}")]
pub struct OverlayApplyError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

/// Merging the backed-up passwd/group databases into the live ones failed.
#[derive(Error, Debug)]
pub enum IdentityMergeError {
    #[error("{file}: line with incorrect field count ({found} != {expected}) '{line}'")]
    FieldCount {
        file: &'static str,
        line: String,
        expected: usize,
        found: usize,
    },

    #[error("{file}: invalid numeric id in '{line}'")]
    BadId { file: &'static str, line: String },

    #[error("{file}: can't find slot for new id")]
    NoFreeId { file: &'static str },

    #[error("Cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The package installer could not be run or exited non-zero.
#[derive(Error, Debug)]
pub enum PackageInstallError {
    #[error("Installer exited with code {code:?}")]
    ExitStatus { code: Option<i32>, output: String },

    #[error("Failed to run package manager: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Exporting or importing the database failed.
#[derive(Error, Debug)]
pub enum DatabaseRestoreError {
    #[error("Database export failed: {0}")]
    Export(String),

    #[error("Database import failed for {object}: {reason}")]
    Import { object: String, reason: String },

    #[error("Database reload failed: {0}")]
    Reload(String),

    #[error("Cannot copy database credentials {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fetching or decrypting the backup archive failed.
#[derive(Error, Debug)]
pub enum ArchiveRetrievalError {
    #[error("Valid backup not found at {0:?}")]
    NoBackupChains(String),

    #[error("Error restoring backup (bad key?):\n{0}")]
    Failed(String),

    #[error("Keyfile {path} is unreadable: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup archive has no extras directory at {0}")]
    MissingExtras(PathBuf),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A restore hook could not be run or exited non-zero.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("`{hook} {args}` non-zero exitcode ({code:?})")]
    ExitStatus {
        hook: PathBuf,
        args: String,
        code: Option<i32>,
    },

    #[error("Failed to run hook {hook}: {source}")]
    Spawn {
        hook: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Identity merge error: {0}")]
    IdentityMerge(#[from] IdentityMergeError),

    #[error("Database restore error: {0}")]
    DatabaseRestore(#[from] DatabaseRestoreError),

    #[error("Archive retrieval error: {0}")]
    ArchiveRetrieval(#[from] ArchiveRetrievalError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Another restore holds the lock at {0}")]
    Locked(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

pub type Result<T> = std::result::Result<T, RestoreError>;
