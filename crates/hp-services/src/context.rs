//! Host collaborators shared by the services, and the calling identity.

use hp_core::database::MysqlAdmin;
use hp_core::dns::ZoneManager;
use hp_core::exec::CommandRunner;
use hp_core::fs::HostPaths;
use hp_core::mail::MailRegistrar;
use hp_core::php::PhpFpmManager;
use hp_core::ssl::SslManager;
use hp_core::system::PosixUsers;
use hp_core::web::{VhostDriver, WebServerKind};
use hp_db::models::{Role, User};

/// Host-wide settings the services need beyond paths.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub web_server: WebServerKind,
    pub php_default_version: String,
    pub server_ip: String,
    pub nameservers: Vec<String>,
    pub acme_email: Option<String>,
}

/// Every host primitive, built once from one runner and one path layout so
/// simulate mode reaches all of them.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub settings: HostSettings,
    pub runner: CommandRunner,
    pub paths: HostPaths,
    pub vhosts: VhostDriver,
    pub php: PhpFpmManager,
    pub zones: ZoneManager,
    pub mail: MailRegistrar,
    pub users: PosixUsers,
    pub mysql: MysqlAdmin,
    pub ssl: SslManager,
}

impl HostContext {
    pub fn new(runner: CommandRunner, paths: HostPaths, settings: HostSettings) -> Self {
        let vhosts = VhostDriver::from_kind(settings.web_server, runner.clone(), paths.clone());
        Self {
            php: PhpFpmManager::new(runner.clone(), paths.clone()),
            zones: ZoneManager::new(runner.clone(), paths.clone(), settings.nameservers.clone()),
            mail: MailRegistrar::new(runner.clone(), paths.clone()),
            users: PosixUsers::new(runner.clone(), paths.clone()),
            mysql: MysqlAdmin::new(runner.clone()),
            ssl: SslManager::new(
                runner.clone(),
                paths.clone(),
                vhosts.clone(),
                settings.acme_email.clone(),
            ),
            vhosts,
            settings,
            runner,
            paths,
        }
    }

    /// Home directory of `username` as it exists on this host.
    pub fn home_on_disk(&self, username: &str) -> std::path::PathBuf {
        self.paths.resolve(self.paths.home(username))
    }
}

/// Who is calling: the authenticated panel user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub username: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: i64, username: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            username: username.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins manage everyone, resellers themselves and their own clients,
    /// users only themselves.
    pub fn can_manage(&self, user: &User) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Reseller => user.id == self.id || user.parent_id == Some(self.id),
            Role::User => user.id == self.id,
        }
    }
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self::new(user.id, user.username.clone(), user.role)
    }
}
