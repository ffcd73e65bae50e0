//! Interfaces to the external tools a restore drives.
//!
//! The engine only talks to these traits; the implementations are thin
//! wrappers that shell out to duplicity, apt and the mysql client tools.

pub mod apt;
pub mod duplicity;
pub mod mysql;

pub use apt::AptPackageManager;
pub use duplicity::DuplicityArchive;
pub use mysql::MySqlTool;

use std::fmt;
use std::path::Path;

use crate::limits::DbFilter;
use crate::utils::errors::{ArchiveRetrievalError, DatabaseRestoreError, PackageInstallError};

/// Source of backup archives
pub trait ArchiveSource {
    /// Retrieve and decrypt the archive at `address` into `dest`
    fn fetch(&self, address: &str, passphrase: &str, dest: &Path)
        -> Result<(), ArchiveRetrievalError>;
}

/// Packages split by whether the package manager can install them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub installable: Vec<String>,
    /// Not installed and not available
    pub skipping: Vec<String>,
}

pub trait PackageManager {
    /// Refresh the package index, returning the tool output
    fn refresh(&self) -> Result<String, PackageInstallError>;

    /// Which of `packages` are missing and installable
    fn plan(&self, packages: &[String]) -> Result<InstallPlan, PackageInstallError>;

    /// Transcript line for installing `packages`
    fn install_command(&self, packages: &[String]) -> String;

    /// Install `packages`, returning the tool output
    fn install(&self, packages: &[String]) -> Result<String, PackageInstallError>;
}

/// A database or table reached while importing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbObject {
    Database { name: String },
    Table { database: String, name: String },
}

impl DbObject {
    /// `db` or `db/table`, as matched by database limits
    pub fn resource(&self) -> String {
        match self {
            DbObject::Database { name } => name.clone(),
            DbObject::Table { database, name } => format!("{}/{}", database, name),
        }
    }
}

impl fmt::Display for DbObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbObject::Database { name } => write!(f, "database: {}", name),
            DbObject::Table { database, name } => write!(f, "table: {}/{}", database, name),
        }
    }
}

pub trait DatabaseTool {
    /// Engine name, used for capsule and extras layout (`etc/<engine>`)
    fn engine(&self) -> &str;

    /// Live credentials file the engine's maintenance account uses
    fn credentials(&self) -> &Path;

    /// Export every database into `dest`
    fn export(&self, dest: &Path) -> Result<(), DatabaseRestoreError>;

    /// Load an export from `source`, restricted to `filter`, calling
    /// `progress` for each database and table as it is reached
    fn import(
        &self,
        source: &Path,
        filter: &DbFilter,
        progress: &mut dyn FnMut(&DbObject),
    ) -> Result<(), DatabaseRestoreError>;

    /// Ask the running server to reload (e.g. after credentials change)
    fn reload(&self) -> Result<(), DatabaseRestoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_object_display() {
        let db = DbObject::Database {
            name: "shop".to_string(),
        };
        let table = DbObject::Table {
            database: "shop".to_string(),
            name: "orders".to_string(),
        };
        assert_eq!(db.to_string(), "database: shop");
        assert_eq!(table.to_string(), "table: shop/orders");
        assert_eq!(table.resource(), "shop/orders");
    }
}
