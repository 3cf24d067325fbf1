//! apt command plans for installing and removing PHP versions.
//!
//! Plans are plain [`CommandSpec`] lists so they can be streamed through a
//! task while they run.

use crate::exec::CommandSpec;
use crate::security::input::{validate_php_version, ValidationError};

/// Versions offered for installation.
pub const SUPPORTED_VERSIONS: &[&str] = &["7.4", "8.0", "8.1", "8.2", "8.3"];

pub const RECOMMENDED_VERSION: &str = "8.2";

/// Extensions installed alongside every FPM build.
pub const PHP_EXTENSIONS: &[&str] = &[
    "cli", "common", "mysql", "zip", "gd", "intl", "opcache", "xml", "mbstring", "curl", "bcmath",
];

fn supported(version: &str) -> Result<&str, ValidationError> {
    validate_php_version(version)?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ValidationError::InvalidPhpVersion(version.to_string()));
    }
    Ok(version)
}

/// `php<ver>-fpm` followed by every extension package.
pub fn fpm_packages(version: &str) -> Vec<String> {
    let mut packages = vec![format!("php{}-fpm", version)];
    packages.extend(PHP_EXTENSIONS.iter().map(|ext| format!("php{}-{}", version, ext)));
    packages
}

/// Refresh indexes, install the FPM build, start its master.
pub fn install_plan(version: &str) -> Result<Vec<CommandSpec>, ValidationError> {
    let version = supported(version)?;
    Ok(vec![
        CommandSpec::new("apt-get").arg("update").noninteractive(),
        CommandSpec::new("apt-get")
            .args(["install", "-y", "--no-install-recommends"])
            .args(fpm_packages(version))
            .noninteractive(),
        CommandSpec::new("systemctl")
            .args(["enable", "--now"])
            .arg(format!("php{}-fpm", version)),
    ])
}

/// Stop the master, purge the packages, clean up orphans.
pub fn uninstall_plan(version: &str) -> Result<Vec<CommandSpec>, ValidationError> {
    let version = supported(version)?;
    Ok(vec![
        CommandSpec::new("systemctl")
            .args(["disable", "--now"])
            .arg(format!("php{}-fpm", version)),
        CommandSpec::new("apt-get")
            .args(["purge", "-y"])
            .args(fpm_packages(version))
            .noninteractive(),
        CommandSpec::new("apt-get")
            .args(["autoremove", "-y"])
            .noninteractive(),
    ])
}
