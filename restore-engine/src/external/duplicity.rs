use std::path::Path;
use tracing::{debug, info};

use super::ArchiveSource;
use crate::utils::errors::ArchiveRetrievalError;
use crate::utils::process;

const NO_CHAINS: &str = "No backup chains found";

/// Archive retrieval through duplicity
#[derive(Debug, Clone)]
pub struct DuplicityArchive {
    command: String,
}

impl DuplicityArchive {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl ArchiveSource for DuplicityArchive {
    fn fetch(
        &self,
        address: &str,
        passphrase: &str,
        dest: &Path,
    ) -> Result<(), ArchiveRetrievalError> {
        info!("Retrieving backup from {}", address);

        // The passphrase only ever lives in the child's environment
        let mut cmd = process::command(&self.command);
        cmd.arg(address).arg(dest).env("PASSPHRASE", passphrase);

        let out = process::run(&mut cmd)?;
        debug!("duplicity exited with {:?}", out.code());

        if out.success() {
            Ok(())
        } else if out.output.contains(NO_CHAINS) {
            Err(ArchiveRetrievalError::NoBackupChains(address.to_string()))
        } else {
            Err(ArchiveRetrievalError::Failed(out.output))
        }
    }
}
