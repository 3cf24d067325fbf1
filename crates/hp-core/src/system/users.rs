//! POSIX accounts backing hosting users.

use std::fs;
use std::io;
use std::path::PathBuf;

use sysinfo::System;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::fs::paths::display;
use crate::fs::HostPaths;

/// Lowest uid handed out to regular users by `useradd`.
pub const MIN_REGULAR_UID: u32 = 1000;

/// Identity reported for every existing user in simulate mode.
const SIMULATED_ID: u32 = MIN_REGULAR_UID;

/// `userdel` exit code for "could not remove home directory".
const USERDEL_HOME_NOT_REMOVED: i32 = 12;

#[derive(Debug, Error)]
pub enum UserError {
    #[error(transparent)]
    Command(#[from] RunnerError),
    #[error("User {username} has uid {uid}, below {MIN_REGULAR_UID}")]
    SystemAccount { username: String, uid: u32 },
    #[error("User lookup failed for {0}: {1}")]
    Lookup(String, nix::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Numeric identity of an existing POSIX user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Creates, inspects and removes POSIX users through the command runner.
///
/// In simulate mode the rebased home directory stands in for the passwd
/// database: a user exists exactly when its sandboxed home does.
#[derive(Debug, Clone)]
pub struct PosixUsers {
    runner: CommandRunner,
    paths: HostPaths,
}

impl PosixUsers {
    pub fn new(runner: CommandRunner, paths: HostPaths) -> Self {
        Self { runner, paths }
    }

    fn home_on_disk(&self, username: &str) -> PathBuf {
        self.paths.resolve(self.paths.home(username))
    }

    pub fn lookup(&self, username: &str) -> Result<Option<PosixIdentity>, UserError> {
        if self.runner.is_simulated() {
            return Ok(self.home_on_disk(username).is_dir().then_some(PosixIdentity {
                uid: SIMULATED_ID,
                gid: SIMULATED_ID,
            }));
        }
        let user = nix::unistd::User::from_name(username)
            .map_err(|e| UserError::Lookup(username.to_string(), e))?;
        Ok(user.map(|u| PosixIdentity {
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
        }))
    }

    pub fn exists(&self, username: &str) -> Result<bool, UserError> {
        Ok(self.lookup(username)?.is_some())
    }

    pub fn has_public_html(&self, username: &str) -> bool {
        self.paths
            .resolve(self.paths.public_html(username))
            .is_dir()
    }

    /// Identity of an existing user that may be adopted by the panel.
    pub fn regular_identity(&self, username: &str) -> Result<Option<PosixIdentity>, UserError> {
        match self.lookup(username)? {
            Some(id) if id.uid < MIN_REGULAR_UID => Err(UserError::SystemAccount {
                username: username.to_string(),
                uid: id.uid,
            }),
            other => Ok(other),
        }
    }

    /// `useradd -m -d <home> -s /bin/bash -U <user>`.
    pub async fn create(&self, username: &str) -> Result<(), UserError> {
        let home = display(&self.paths.home(username));
        let spec = CommandSpec::new("useradd").args([
            "-m", "-d", home.as_str(), "-s", "/bin/bash", "-U", username,
        ]);
        self.runner.run_checked(&spec).await?;
        if self.runner.is_simulated() {
            fs::create_dir_all(self.home_on_disk(username))?;
        }
        info!(username, home = %home, "Created POSIX user");
        Ok(())
    }

    /// `userdel -r <user>`. Returns false when there was no such user.
    pub async fn delete(&self, username: &str) -> Result<bool, UserError> {
        if !self.exists(username)? {
            debug!(username, "POSIX user already absent");
            return Ok(false);
        }
        let spec = CommandSpec::new("userdel").args(["-r", username]);
        let output = self.runner.run(&spec).await?;
        if output.status == Some(USERDEL_HOME_NOT_REMOVED) {
            warn!(username, output = %output.combined(), "userdel left the home directory behind");
            return Ok(true);
        }
        output.into_result(&spec)?;
        info!(username, "Deleted POSIX user");
        Ok(true)
    }

    /// `pkill -9 -u <user>`. Exit 1 only means nothing matched.
    pub async fn kill_all(&self, username: &str) -> Result<(), UserError> {
        let spec = CommandSpec::new("pkill").args(["-9", "-u", username]);
        let output = self.runner.run(&spec).await?;
        match output.status {
            Some(0) => info!(username, "Killed user processes"),
            Some(1) => debug!(username, "No user processes to kill"),
            _ => {
                output.into_result(&spec)?;
            }
        }
        Ok(())
    }

    /// Pids of processes still owned by `uid`. Always empty when simulating.
    pub fn remaining_processes(&self, uid: u32) -> Vec<u32> {
        if self.runner.is_simulated() {
            return Vec::new();
        }
        let sys = System::new_all();
        sys.processes()
            .iter()
            .filter(|(_, process)| process.user_id().is_some_and(|owner| **owner == uid))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    /// Unlink the whole home tree. A missing home is not an error.
    pub fn remove_home(&self, username: &str) -> Result<bool, UserError> {
        let home = self.home_on_disk(username);
        match fs::remove_dir_all(&home) {
            Ok(()) => {
                info!(home = %home.display(), "Removed home directory");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
