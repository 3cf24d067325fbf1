use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use super::opendkim::{DkimEntry, KEY_DIR};
use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::fs::paths::display;
use crate::fs::permissions::{chown_tree, set_mode, Ownership, PermissionError};
use crate::fs::HostPaths;

const DKIM_USER: &str = "opendkim";

#[derive(Debug, Error)]
pub enum DkimError {
    #[error(transparent)]
    Command(#[from] RunnerError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Key pairs under `/etc/opendkim/keys/<domain>/`.
#[derive(Debug, Clone)]
pub struct DkimKeys {
    runner: CommandRunner,
    paths: HostPaths,
}

impl DkimKeys {
    pub fn new(runner: CommandRunner, paths: HostPaths) -> Self {
        Self { runner, paths }
    }

    pub fn key_dir(&self, domain: &str) -> PathBuf {
        PathBuf::from(KEY_DIR).join(domain)
    }

    pub fn has_key(&self, domain: &str) -> bool {
        self.paths
            .resolve(DkimEntry::new(domain).private_key_path())
            .exists()
    }

    /// Generate `default.private`/`default.txt` unless the private key is
    /// already there. Returns whether a key was generated.
    pub async fn ensure_key(&self, domain: &str) -> Result<bool, DkimError> {
        if self.has_key(domain) {
            debug!(domain, "DKIM key already present");
            return Ok(false);
        }

        let key_dir = self.key_dir(domain);
        let key_dir_on_disk = self.paths.resolve(&key_dir);
        fs::create_dir_all(&key_dir_on_disk)?;

        let entry = DkimEntry::new(domain);
        let spec = CommandSpec::new("opendkim-genkey").args([
            "-s",
            entry.selector.as_str(),
            "-d",
            domain,
            "-D",
            display(&key_dir).as_str(),
        ]);
        self.runner.run_checked(&spec).await?;

        if !self.runner.is_simulated() {
            chown_tree(&key_dir_on_disk, Ownership::of(DKIM_USER, DKIM_USER)?)?;
        }
        let private_key = self.paths.resolve(entry.private_key_path());
        if private_key.exists() {
            set_mode(&private_key, 0o600)?;
        }

        info!(domain, selector = %entry.selector, "Generated DKIM key");
        Ok(true)
    }

    /// The `default.txt` record as written by the key generator.
    pub fn dns_record(&self, domain: &str) -> Result<Option<String>, DkimError> {
        let path = self.paths.resolve(self.key_dir(domain).join("default.txt"));
        match fs::read_to_string(path) {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_key(&self, domain: &str) -> Result<bool, DkimError> {
        match fs::remove_dir_all(self.paths.resolve(self.key_dir(domain))) {
            Ok(()) => {
                info!(domain, "Deleted DKIM keys");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
