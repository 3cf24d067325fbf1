use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::limits::{IniOverrides, LimitError, OVERRIDE_KEYS};
use super::parser::{parse_pool, PoolLine, PoolParseError};
use super::pool::PoolConfig;
use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::fs::atomic::{atomic_write_config, remove_if_exists, AtomicWriteError};
use crate::fs::HostPaths;
use crate::security::input::{validate_php_version, ValidationError};
use crate::service::{php_fpm_unit, ServiceManager};

pub const PHP_CONFIG_ROOT: &str = "/etc/php";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Limits(#[from] LimitError),
    #[error("Failed to parse pool file: {0}")]
    Parse(#[from] PoolParseError),
    #[error("Failed to write pool: {0}")]
    Write(#[from] AtomicWriteError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] RunnerError),
    #[error("PHP {version} FPM configuration test failed: {output}")]
    ConfigTest { version: String, output: String },
}

/// Per-user PHP-FPM pools, one file per user per installed version.
#[derive(Debug, Clone)]
pub struct PhpFpmManager {
    runner: CommandRunner,
    paths: HostPaths,
    services: ServiceManager,
    listen_group: String,
}

impl PhpFpmManager {
    pub fn new(runner: CommandRunner, paths: HostPaths) -> Self {
        Self {
            services: ServiceManager::new(runner.clone()),
            runner,
            paths,
            listen_group: super::pool::DEFAULT_LISTEN_GROUP.to_string(),
        }
    }

    pub fn with_listen_group(mut self, group: impl Into<String>) -> Self {
        self.listen_group = group.into();
        self
    }

    /// Logical `/etc/php/<ver>/fpm/pool.d/<user>.conf`.
    pub fn pool_path(&self, username: &str, version: &str) -> PathBuf {
        PathBuf::from(PHP_CONFIG_ROOT)
            .join(version)
            .join("fpm/pool.d")
            .join(format!("{}.conf", username))
    }

    pub fn pool_exists(&self, username: &str, version: &str) -> bool {
        self.paths.resolve(self.pool_path(username, version)).exists()
    }

    /// Versions with an `fpm` directory under `/etc/php`, sorted.
    pub fn installed_versions(&self) -> Result<Vec<String>, PoolError> {
        let root = self.paths.resolve(PHP_CONFIG_ROOT);
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_php_version(&name).is_ok() && entry.path().join("fpm").is_dir() {
                versions.push(name);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Write a fresh pool for `username`. Rewriting an existing pool with the
    /// same inputs produces the same file.
    pub async fn create_pool(
        &self,
        username: &str,
        version: &str,
        overrides: &IniOverrides,
    ) -> Result<PathBuf, PoolError> {
        validate_php_version(version)?;
        overrides.validate()?;

        let mut config = PoolConfig::new(username, version, self.paths.home(username))
            .with_overrides(overrides.clone());
        config.listen_group = self.listen_group.clone();

        let path = self.pool_path(username, version);
        self.write_tested(&path, version, &config.render()).await?;
        self.reload(version).await;
        info!(username, version, "PHP-FPM pool written");
        Ok(path)
    }

    /// Replace the override directives in an existing pool, keeping every
    /// other line as it is. A missing pool is created.
    pub async fn update_overrides(
        &self,
        username: &str,
        version: &str,
        overrides: &IniOverrides,
    ) -> Result<(), PoolError> {
        validate_php_version(version)?;
        overrides.validate()?;

        let path = self.pool_path(username, version);
        let on_disk = self.paths.resolve(&path);
        let existing = match fs::read_to_string(&on_disk) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.create_pool(username, version, overrides).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut pool = parse_pool(&existing)?;
        pool.remove_where(|key| OVERRIDE_KEYS.contains(&key));
        while matches!(pool.entries.last(), Some(PoolLine::Blank)) {
            pool.entries.pop();
        }
        for (key, value) in overrides.directives() {
            pool.set(&key, &value);
        }

        self.write_tested(&path, version, &pool.serialize()).await?;
        self.reload(version).await;
        info!(username, version, "PHP-FPM overrides updated");
        Ok(())
    }

    /// Remove one pool and reload that version. Returns whether it existed.
    pub async fn delete_pool(&self, username: &str, version: &str) -> Result<bool, PoolError> {
        let removed = remove_if_exists(&self.paths.resolve(self.pool_path(username, version)))?;
        if removed {
            self.reload(version).await;
            info!(username, version, "PHP-FPM pool deleted");
        }
        Ok(removed)
    }

    /// Remove the user's pool from every installed version without reloading.
    /// Returns the versions whose master must be restarted.
    pub fn delete_user_pools(&self, username: &str) -> Result<Vec<String>, PoolError> {
        let mut touched = Vec::new();
        for version in self.installed_versions()? {
            if remove_if_exists(&self.paths.resolve(self.pool_path(username, &version)))? {
                debug!(username, version = %version, "Removed pool file");
                touched.push(version);
            }
        }
        Ok(touched)
    }

    /// `php-fpm<ver> -t`.
    pub async fn test(&self, version: &str) -> Result<(), PoolError> {
        let spec = CommandSpec::new(format!("php-fpm{}", version)).arg("-t");
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(PoolError::ConfigTest {
                version: version.to_string(),
                output: output.combined(),
            });
        }
        Ok(())
    }

    pub async fn reload(&self, version: &str) -> Option<String> {
        self.services.reload_lenient(&php_fpm_unit(version)).await
    }

    /// Restart the FPM master so workers of deleted pools exit.
    pub async fn restart(&self, version: &str) -> Option<String> {
        self.services.restart_lenient(&php_fpm_unit(version)).await
    }

    /// Write `content`, run the FPM config test, and put the previous file
    /// back if the test fails.
    async fn write_tested(&self, path: &Path, version: &str, content: &str) -> Result<(), PoolError> {
        let on_disk = self.paths.resolve(path);
        let previous = match fs::read_to_string(&on_disk) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        atomic_write_config(&on_disk, content)?;
        if let Err(e) = self.test(version).await {
            warn!(path = %path.display(), error = %e, "Pool rejected, restoring previous state");
            match previous {
                Some(old) => atomic_write_config(&on_disk, &old)?,
                None => {
                    remove_if_exists(&on_disk)?;
                }
            }
            return Err(e);
        }
        Ok(())
    }
}
