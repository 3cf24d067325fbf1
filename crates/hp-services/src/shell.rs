//! Opening interactive shells for panel users.

use thiserror::Error;
use tracing::info;

use hp_actors::shell::ShellSessions;
use hp_core::exec::pty::{PtyError, PtySession, ShellIdentity, ShellLaunch};
use hp_core::fs::paths::display;
use hp_core::system::users::UserError;
use hp_db::{queries, Database, DbError};

use crate::context::{Actor, HostContext};
use crate::error::{db_kind, ErrorKind};

const ROOT_HOME: &str = "/root";

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Account is suspended: {0}")]
    Suspended(String),
    #[error("No system user for {0}")]
    NoSystemUser(String),
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl ShellError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Suspended(_) => ErrorKind::Forbidden,
            Self::NoSystemUser(_) => ErrorKind::NotFound,
            Self::Pty(PtyError::Refused(_)) => ErrorKind::Forbidden,
            Self::User(_) | Self::Pty(_) => ErrorKind::Internal,
            Self::Database(e) => db_kind(e),
        }
    }
}

/// A live shell. Dropping it kills the process group and removes the
/// session from the table, whichever side of the bridge went away first.
pub struct OpenShell {
    id: u64,
    pty: PtySession,
    sessions: ShellSessions,
}

impl OpenShell {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pty(&self) -> &PtySession {
        &self.pty
    }

    pub fn pty_mut(&mut self) -> &mut PtySession {
        &mut self.pty
    }
}

impl Drop for OpenShell {
    fn drop(&mut self) {
        self.pty.kill();
        self.sessions.deregister(self.id);
    }
}

#[derive(Clone)]
pub struct ShellService {
    db: Database,
    host: HostContext,
    sessions: ShellSessions,
}

impl ShellService {
    pub fn new(db: Database, host: HostContext, sessions: ShellSessions) -> Self {
        Self { db, host, sessions }
    }

    pub fn sessions(&self) -> &ShellSessions {
        &self.sessions
    }

    /// Admins get a root shell; everyone else runs as their own POSIX user
    /// in their home directory.
    pub async fn open(&self, actor: &Actor, rows: u16, cols: u16) -> Result<OpenShell, ShellError> {
        let user = queries::get_user(self.db.pool(), actor.id).await?;
        if !user.is_active {
            return Err(ShellError::Suspended(user.username));
        }

        let (home, identity) = if actor.is_admin() {
            let home = if self.host.paths.is_rebased() {
                display(self.host.paths.root())
            } else {
                ROOT_HOME.to_string()
            };
            (home, ShellIdentity::Root)
        } else {
            let id = self
                .host
                .users
                .lookup(&user.username)?
                .ok_or_else(|| ShellError::NoSystemUser(user.username.clone()))?;
            (
                display(&self.host.home_on_disk(&user.username)),
                ShellIdentity::User { uid: id.uid, gid: id.gid },
            )
        };

        let launch = ShellLaunch {
            username: user.username.clone(),
            home,
            identity,
            rows,
            cols,
        };
        let pty = self.host.runner.spawn_shell(&launch)?;
        let id = self.sessions.register(&user.username, pty.pid());
        info!(session = id, user = %user.username, admin = actor.is_admin(), "Shell opened");
        Ok(OpenShell {
            id,
            pty,
            sessions: self.sessions.clone(),
        })
    }
}
