//! Restore hooks.
//!
//! Every executable in the hooks directory runs with `restore pre` before the
//! restore starts and `restore post` after it finishes. A hook exiting
//! non-zero stops the restore.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::utils::errors::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Pre,
    Post,
}

impl HookStage {
    fn as_str(&self) -> &'static str {
        match self {
            HookStage::Pre => "pre",
            HookStage::Post => "post",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hooks {
    dir: PathBuf,
}

impl Hooks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Executable hooks in name order; signature files are not hooks
    fn scripts(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut scripts = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "sig") {
                continue;
            }
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                scripts.push(path);
            }
        }
        scripts.sort();
        Ok(scripts)
    }

    pub fn run(&self, stage: HookStage) -> Result<(), HookError> {
        let args = ["restore", stage.as_str()];
        let scripts = self.scripts().map_err(|source| HookError::Spawn {
            hook: self.dir.clone(),
            source,
        })?;

        for hook in scripts {
            info!("Running hook {} {}", hook.display(), args.join(" "));
            let status = Command::new(&hook)
                .args(args)
                .status()
                .map_err(|source| HookError::Spawn {
                    hook: hook.clone(),
                    source,
                })?;

            if !status.success() {
                return Err(HookError::ExitStatus {
                    hook,
                    args: args.join(" "),
                    code: status.code(),
                });
            }
            debug!("Hook {} done", hook.display());
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
