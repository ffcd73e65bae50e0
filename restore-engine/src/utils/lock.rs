//! Advisory lock serializing restore runs.
//!
//! The rollback capsule lives at a single fixed location, so two restores
//! running at once would corrupt each other's capsule. The lock file sits
//! next to the capsule directory.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::errors::{RestoreError, Result};

pub struct RestoreLock {
    file: File,
    path: PathBuf,
}

impl RestoreLock {
    /// Lock file path used for a given capsule location
    pub fn path_for(capsule_dir: &Path) -> PathBuf {
        let mut name = capsule_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "restore".into());
        name.push(".lock");
        capsule_dir.with_file_name(name)
    }

    /// Take the lock without blocking; fails with `RestoreError::Locked` if held
    pub fn acquire(capsule_dir: &Path) -> Result<Self> {
        let path = Self::path_for(capsule_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(RestoreError::Locked(path));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_sits_next_to_capsule() {
        let path = RestoreLock::path_for(Path::new("/var/backups/tklbam-rollback"));
        assert_eq!(path, PathBuf::from("/var/backups/tklbam-rollback.lock"));
    }

    #[test]
    fn test_second_lock_is_refused() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let capsule = temp_dir.path().join("rollback");

        let first = RestoreLock::acquire(&capsule)?;
        assert!(first.path().exists());

        match RestoreLock::acquire(&capsule) {
            Err(RestoreError::Locked(path)) => assert_eq!(path, first.path()),
            other => panic!("expected lock contention, got {:?}", other.map(|l| l.path().to_path_buf())),
        }

        drop(first);
        RestoreLock::acquire(&capsule)?;
        Ok(())
    }
}
