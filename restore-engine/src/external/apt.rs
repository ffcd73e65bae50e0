use std::collections::HashSet;
use std::process::Command;
use tracing::debug;

use super::{InstallPlan, PackageManager};
use crate::utils::errors::PackageInstallError;
use crate::utils::process::{self, CommandOutput};

/// Debian package management through dpkg-query, apt-cache and apt-get
#[derive(Debug, Clone)]
pub struct AptPackageManager {
    apt_get: String,
    apt_cache: String,
    dpkg_query: String,
}

impl AptPackageManager {
    pub fn new(
        apt_get: impl Into<String>,
        apt_cache: impl Into<String>,
        dpkg_query: impl Into<String>,
    ) -> Self {
        Self {
            apt_get: apt_get.into(),
            apt_cache: apt_cache.into(),
            dpkg_query: dpkg_query.into(),
        }
    }

    fn install_cmd(&self, packages: &[String]) -> Command {
        let mut cmd = process::command(&self.apt_get);
        cmd.args(["install", "--assume-yes"]).args(packages);
        cmd
    }

    fn installed(&self) -> Result<HashSet<String>, PackageInstallError> {
        let mut cmd = process::command(&self.dpkg_query);
        cmd.args(["-W", "--showformat=${Package} ${Status}\n"]);
        let out = checked(process::run(&mut cmd)?)?;

        Ok(out
            .lines()
            .filter(|line| line.ends_with(" installed") && !line.contains(" not-installed"))
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    fn available(&self) -> Result<HashSet<String>, PackageInstallError> {
        let mut cmd = process::command(&self.apt_cache);
        cmd.arg("pkgnames");
        let out = checked(process::run(&mut cmd)?)?;

        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }
}

fn checked(out: CommandOutput) -> Result<String, PackageInstallError> {
    if out.success() {
        Ok(out.output)
    } else {
        Err(PackageInstallError::ExitStatus {
            code: out.code(),
            output: out.output,
        })
    }
}

impl PackageManager for AptPackageManager {
    fn refresh(&self) -> Result<String, PackageInstallError> {
        let mut cmd = process::command(&self.apt_get);
        cmd.arg("update");
        checked(process::run(&mut cmd)?)
    }

    fn plan(&self, packages: &[String]) -> Result<InstallPlan, PackageInstallError> {
        let installed = self.installed()?;
        let available = self.available()?;
        debug!(
            "{} packages installed, {} available",
            installed.len(),
            available.len()
        );

        let mut plan = InstallPlan::default();
        for package in packages {
            if installed.contains(package) {
                continue;
            }
            if available.contains(package) {
                plan.installable.push(package.clone());
            } else {
                plan.skipping.push(package.clone());
            }
        }
        Ok(plan)
    }

    fn install_command(&self, packages: &[String]) -> String {
        process::command_line(&self.install_cmd(packages))
    }

    fn install(&self, packages: &[String]) -> Result<String, PackageInstallError> {
        if packages.is_empty() {
            return Ok(String::new());
        }

        let mut cmd = self.install_cmd(packages);
        cmd.env("DEBIAN_FRONTEND", "noninteractive");
        checked(process::run(&mut cmd)?)
    }
}
