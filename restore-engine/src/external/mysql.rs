//! MySQL export and import through the mysql client tools.
//!
//! Exports are laid out one directory per database:
//!
//! ```text
//! <dir>/<database>/init.sql
//! <dir>/<database>/tables/<table>.sql
//! ```
//!
//! so a limited import can pick individual databases and tables.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use super::{DatabaseTool, DbObject};
use crate::limits::DbFilter;
use crate::utils::errors::DatabaseRestoreError;
use crate::utils::process;

const INIT_FILE: &str = "init.sql";
const TABLES_DIR: &str = "tables";

/// Databases the server maintains itself and never exports
const SKIP_DATABASES: &[&str] = &["information_schema", "performance_schema", "sys"];

#[derive(Debug, Clone)]
pub struct MySqlTool {
    client: String,
    dump: String,
    credentials: PathBuf,
    pid_file: PathBuf,
}

impl MySqlTool {
    pub fn new(
        client: impl Into<String>,
        dump: impl Into<String>,
        credentials: impl Into<PathBuf>,
        pid_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client: client.into(),
            dump: dump.into(),
            credentials: credentials.into(),
            pid_file: pid_file.into(),
        }
    }

    fn defaults_file(&self) -> String {
        format!("--defaults-file={}", self.credentials.display())
    }

    fn client(&self) -> Command {
        let mut cmd = process::command(&self.client);
        cmd.arg(self.defaults_file());
        cmd
    }

    /// Run a query, one output row per line
    fn query(&self, database: Option<&str>, sql: &str) -> Result<Vec<String>, DatabaseRestoreError> {
        let mut cmd = self.client();
        cmd.args(["-N", "-B", "-e", sql]);
        if let Some(database) = database {
            cmd.arg(database);
        }

        let out = process::run(&mut cmd)?;
        if !out.success() {
            return Err(DatabaseRestoreError::Export(format!(
                "`{}` failed: {}",
                sql,
                out.output.trim()
            )));
        }
        Ok(out
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn export_database(&self, database: &str, dest: &Path) -> Result<(), DatabaseRestoreError> {
        let tables_dir = dest.join(database).join(TABLES_DIR);
        fs::create_dir_all(&tables_dir)?;
        fs::write(
            dest.join(database).join(INIT_FILE),
            format!("CREATE DATABASE IF NOT EXISTS `{}`;\n", database),
        )?;

        for table in self.query(Some(database), "SHOW TABLES")? {
            let mut cmd = process::command(&self.dump);
            cmd.arg(self.defaults_file())
                .arg("--skip-extended-insert")
                .arg(database)
                .arg(&table);

            let out = process::run_to_file(&mut cmd, &tables_dir.join(format!("{}.sql", table)))?;
            if !out.success() {
                return Err(DatabaseRestoreError::Export(format!(
                    "dump of {}/{} failed: {}",
                    database,
                    table,
                    out.output.trim()
                )));
            }
            debug!("Exported {}/{}", database, table);
        }
        Ok(())
    }

    fn load(&self, object: &DbObject, database: Option<&str>, file: &Path) -> Result<(), DatabaseRestoreError> {
        let mut cmd = self.client();
        if let Some(database) = database {
            cmd.arg(database);
        }

        let out = process::run_with_input(&mut cmd, file)?;
        if out.success() {
            Ok(())
        } else {
            Err(DatabaseRestoreError::Import {
                object: object.resource(),
                reason: out.output.trim().to_string(),
            })
        }
    }
}

/// Sorted names of the entries in `dir`
fn sorted_entries(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            entries.push((name.to_string(), entry.path()));
        }
    }
    entries.sort();
    Ok(entries)
}

impl DatabaseTool for MySqlTool {
    fn engine(&self) -> &str {
        "mysql"
    }

    fn credentials(&self) -> &Path {
        &self.credentials
    }

    fn export(&self, dest: &Path) -> Result<(), DatabaseRestoreError> {
        fs::create_dir_all(dest)?;
        let databases = self.query(None, "SHOW DATABASES")?;

        for database in databases
            .iter()
            .filter(|d| !SKIP_DATABASES.contains(&d.as_str()))
        {
            self.export_database(database, dest)?;
        }

        info!("Exported databases to {}", dest.display());
        Ok(())
    }

    fn import(
        &self,
        source: &Path,
        filter: &DbFilter,
        progress: &mut dyn FnMut(&DbObject),
    ) -> Result<(), DatabaseRestoreError> {
        for (name, path) in sorted_entries(source)? {
            if !path.is_dir() || !filter.matches(&name) {
                continue;
            }

            let database = DbObject::Database { name: name.clone() };
            progress(&database);
            self.load(&database, None, &path.join(INIT_FILE))?;

            let tables_dir = path.join(TABLES_DIR);
            if !tables_dir.is_dir() {
                continue;
            }

            for (file, table_path) in sorted_entries(&tables_dir)? {
                let Some(table_name) = file.strip_suffix(".sql") else {
                    continue;
                };
                let table = DbObject::Table {
                    database: name.clone(),
                    name: table_name.to_string(),
                };
                if !filter.matches(&table.resource()) {
                    continue;
                }

                progress(&table);
                self.load(&table, Some(&name), &table_path)?;
            }
        }
        Ok(())
    }

    fn reload(&self) -> Result<(), DatabaseRestoreError> {
        let raw = fs::read_to_string(&self.pid_file).map_err(|e| {
            DatabaseRestoreError::Reload(format!("{}: {}", self.pid_file.display(), e))
        })?;
        let pid: i32 = raw.trim().parse().map_err(|_| {
            DatabaseRestoreError::Reload(format!("bad pid in {}", self.pid_file.display()))
        })?;

        kill(Pid::from_raw(pid), Signal::SIGHUP)
            .map_err(|e| DatabaseRestoreError::Reload(format!("SIGHUP to {}: {}", pid, e)))?;

        info!("Sent SIGHUP to mysqld ({})", pid);
        Ok(())
    }
}
