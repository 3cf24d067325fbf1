use std::sync::Arc;
use std::time::Duration;

use hp_actors::{ShellSessions, TaskRegistry};
use hp_core::mail::SendmailTransport;
use hp_db::Database;
use hp_services::{
    AccountOrchestrator, HostContext, InstallService, MailService, PhpSettingsService, ShellService,
    SslService,
};

/// Signing key and lifetime for API tokens.
#[derive(Clone)]
pub struct JwtKeys {
    pub secret: Arc<Vec<u8>>,
    pub ttl: Duration,
}

impl JwtKeys {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: Arc::new(secret.into()),
            ttl,
        }
    }
}

/// Shared by every handler. The task registry and shell table are created
/// once here and handed to the services that use them.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub jwt: JwtKeys,
    pub accounts: AccountOrchestrator,
    pub php: PhpSettingsService,
    pub install: InstallService,
    pub mail: Arc<MailService<SendmailTransport>>,
    pub ssl: SslService,
    pub shell: ShellService,
    pub tasks: TaskRegistry,
}

impl AppState {
    pub fn new(db: Database, host: HostContext, jwt: JwtKeys) -> Self {
        let tasks = TaskRegistry::new();
        Self {
            accounts: AccountOrchestrator::new(db.clone(), host.clone()),
            php: PhpSettingsService::new(db.clone(), host.clone()),
            install: InstallService::new(tasks.clone(), host.clone()),
            mail: Arc::new(MailService::new(
                db.clone(),
                SendmailTransport::new(host.runner.clone()),
            )),
            ssl: SslService::new(db.clone(), host.clone()),
            shell: ShellService::new(db.clone(), host, ShellSessions::new()),
            tasks,
            jwt,
            db,
        }
    }

    /// Swap in a differently tuned orchestrator, e.g. a cheap hash cost in tests.
    pub fn with_accounts(mut self, accounts: AccountOrchestrator) -> Self {
        self.accounts = accounts;
        self
    }
}
