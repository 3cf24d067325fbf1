//! Account provisioning and teardown across the metadata store and the host.
//!
//! Creation keeps the metadata transaction open while the host steps run and
//! commits only after every one of them succeeded. A failing step undoes the
//! completed ones in reverse and the transaction is dropped, so neither side
//! keeps a half-created account. Every host step is idempotent, which makes a
//! retry after a crash safe.
//!
//! Deletion follows a fixed order so that no process of the account is alive
//! when its home is unlinked: vhosts and zones, pool files, FPM restart, kill,
//! databases, metadata, system user, home.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

use hp_core::dns::ZoneRecord;
use hp_core::fs::atomic::{atomic_write_config, remove_if_exists};
use hp_core::fs::paths::{display, HOME_SUBDIRS};
use hp_core::fs::permissions::{
    account_manifest, apply_rules, chown_path, chown_tree, Ownership, PermissionError,
};
use hp_core::php::IniOverrides;
use hp_core::security::credentials::{hash_login_password_with_cost, LOGIN_HASH_COST};
use hp_core::security::input::{
    normalize_domain, validate_account_username, validate_email, validate_password,
    ValidationError,
};
use hp_core::system::{PosixIdentity, UserError};
use hp_core::web::VhostSpec;
use hp_db::models::{Domain, NewDnsRecord, NewDomain, NewUser, Package, Role, User};
use hp_db::{queries, Database, DbError};

use crate::context::{Actor, HostContext};
use crate::error::{db_kind, ErrorKind};

/// Dropped into every new `public_html`: no listings, no dotfiles.
const SECURITY_HTACCESS: &str = "\
Options -Indexes
<FilesMatch \"^\\.\">
    Require all denied
</FilesMatch>
";

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),
    #[error("Access denied")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Account is suspended: {0}")]
    Suspended(String),
    #[error("Provisioning step {step} failed: {message}")]
    Step { step: ProvisionStep, message: String },
    #[error(transparent)]
    Database(DbError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AccountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Forbidden | Self::Suspended(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Step { .. } | Self::Internal(_) => ErrorKind::Internal,
            Self::Database(e) => db_kind(e),
        }
    }
}

impl From<ValidationError> for AccountError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<DbError> for AccountError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Duplicate(message) => Self::Conflict(message),
            DbError::NotFound(message) => Self::NotFound(message),
            other => Self::Database(other),
        }
    }
}

/// Host-side steps of account creation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProvisionStep {
    PosixUser,
    HomeTree,
    Vhost,
    PhpPool,
    DnsZone,
    WebmailVhost,
    MailDomain,
    WelcomePage,
}

impl ProvisionStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PosixUser => "posix_user",
            Self::HomeTree => "home_tree",
            Self::Vhost => "vhost",
            Self::PhpPool => "php_pool",
            Self::DnsZone => "dns_zone",
            Self::WebmailVhost => "webmail_vhost",
            Self::MailDomain => "mail_domain",
            Self::WelcomePage => "welcome_page",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward action of every step. Creation runs this table top to bottom.
pub const CREATE_ACTIONS: &[(ProvisionStep, &str)] = &[
    (ProvisionStep::PosixUser, "create system user"),
    (ProvisionStep::HomeTree, "materialise home directory"),
    (ProvisionStep::Vhost, "write domain vhost"),
    (ProvisionStep::PhpPool, "write PHP-FPM pool"),
    (ProvisionStep::DnsZone, "write DNS zone"),
    (ProvisionStep::WebmailVhost, "write webmail vhost"),
    (ProvisionStep::MailDomain, "register mail domain"),
    (ProvisionStep::WelcomePage, "write welcome page"),
];

/// Undo action of every step. Rollback runs the completed ones in reverse.
pub const UNDO_ACTIONS: &[(ProvisionStep, &str)] = &[
    (ProvisionStep::WelcomePage, "remove welcome page"),
    (ProvisionStep::MailDomain, "unregister mail domain"),
    (ProvisionStep::WebmailVhost, "delete webmail vhost"),
    (ProvisionStep::DnsZone, "delete DNS zone"),
    (ProvisionStep::PhpPool, "delete PHP-FPM pool"),
    (ProvisionStep::Vhost, "delete domain vhost"),
    (ProvisionStep::HomeTree, "remove home directory"),
    (ProvisionStep::PosixUser, "delete system user"),
];

fn describe(table: &[(ProvisionStep, &'static str)], step: ProvisionStep) -> &'static str {
    table
        .iter()
        .find(|(s, _)| *s == step)
        .map(|(_, action)| *action)
        .unwrap_or("")
}

fn default_role() -> Role {
    Role::User
}

/// Body of an account creation request.
#[derive(Clone, Deserialize)]
pub struct CreateAccount {
    pub username: String,
    pub email: String,
    pub password: String,
    /// Main domain. Required for hosted roles, refused for admins.
    #[serde(default)]
    pub domain: Option<String>,
    /// Package name. Required for hosted roles.
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default = "default_role")]
    pub role: Role,
}

impl fmt::Debug for CreateAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"********")
            .field("domain", &self.domain)
            .field("package", &self.package)
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedAccount {
    pub user: User,
    pub domain: Option<String>,
    /// An existing system user with a `public_html` was taken over.
    pub adopted_system_user: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountDetails {
    pub user: User,
    pub package: Option<Package>,
    pub domains: Vec<Domain>,
}

/// What deletion did, including everything it could not clean up.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeletionReport {
    pub username: String,
    pub domains: Vec<String>,
    pub php_versions_restarted: Vec<String>,
    pub databases_dropped: Vec<String>,
    pub warnings: Vec<String>,
}

impl DeletionReport {
    fn warn(&mut self, what: &str, error: impl fmt::Display) {
        warn!(username = %self.username, what, error = %error, "Account teardown step failed, continuing");
        self.warnings.push(format!("{}: {}", what, error));
    }
}

/// Names being created right now. Same-name attempts fail fast instead of
/// queueing behind the first one's transaction.
#[derive(Clone, Default)]
struct Reservations(Arc<Mutex<HashSet<String>>>);

impl Reservations {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, keys: Vec<String>) -> Option<Reservation> {
        let mut held = self.lock();
        if keys.iter().any(|k| held.contains(k)) {
            return None;
        }
        held.extend(keys.iter().cloned());
        Some(Reservation {
            owner: self.clone(),
            keys,
        })
    }
}

struct Reservation {
    owner: Reservations,
    keys: Vec<String>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut held = self.owner.lock();
        for key in &self.keys {
            held.remove(key);
        }
    }
}

/// Inputs of the host steps for one account.
struct Provision<'a> {
    username: &'a str,
    email: &'a str,
    domain: &'a str,
    php_version: &'a str,
}

#[derive(Debug, Default)]
struct ProvisionState {
    adopted: bool,
    welcome_written: bool,
    zone_records: Vec<ZoneRecord>,
}

fn welcome_page(domain: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{domain}</title>\n</head>\n<body>\n<h1>{domain}</h1>\n\
         <p>This site is ready for content.</p>\n</body>\n</html>\n"
    )
}

fn dns_rows(records: &[ZoneRecord]) -> Vec<NewDnsRecord> {
    records
        .iter()
        .map(|r| NewDnsRecord {
            name: r.name.clone(),
            record_type: r.record_type.as_str().to_string(),
            content: r.content.clone(),
            ttl: i64::from(r.ttl),
            priority: r.priority.map(i64::from),
        })
        .collect()
}

#[derive(Clone)]
pub struct AccountOrchestrator {
    db: Database,
    host: HostContext,
    reservations: Reservations,
    hash_cost: u32,
    kill_grace: Duration,
}

impl AccountOrchestrator {
    pub fn new(db: Database, host: HostContext) -> Self {
        Self {
            db,
            host,
            reservations: Reservations::default(),
            hash_cost: LOGIN_HASH_COST,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    /// Pause between `pkill` and the residual process check.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// The user behind `user_id`, refusing suspended accounts.
    pub async fn ensure_active(&self, user_id: i64) -> Result<User, AccountError> {
        let user = queries::get_user(self.db.pool(), user_id).await?;
        if !user.is_active {
            return Err(AccountError::Suspended(user.username));
        }
        Ok(user)
    }

    /// Load `user_id` if `actor` may manage it. Non-admins get the same
    /// refusal for missing and foreign accounts.
    async fn authorised_user(&self, actor: &Actor, user_id: i64) -> Result<User, AccountError> {
        match queries::get_user(self.db.pool(), user_id).await {
            Ok(user) if actor.can_manage(&user) => Ok(user),
            Ok(_) => Err(AccountError::Forbidden),
            Err(DbError::NotFound(_)) if !actor.is_admin() => Err(AccountError::Forbidden),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self, actor: &Actor) -> Result<Vec<User>, AccountError> {
        let pool = self.db.pool();
        Ok(match actor.role {
            Role::Admin => queries::list_users(pool).await?,
            Role::Reseller => queries::list_users_by_parent(pool, actor.id).await?,
            Role::User => vec![queries::get_user(pool, actor.id).await?],
        })
    }

    pub async fn get(&self, actor: &Actor, user_id: i64) -> Result<AccountDetails, AccountError> {
        let user = self.authorised_user(actor, user_id).await?;
        let pool = self.db.pool();
        Ok(AccountDetails {
            package: queries::package_for_user(pool, user.id).await?,
            domains: queries::domains_for_user(pool, user.id).await?,
            user,
        })
    }

    // ------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------

    pub async fn create(
        &self,
        actor: &Actor,
        request: CreateAccount,
    ) -> Result<CreatedAccount, AccountError> {
        let parent_id = match (actor.role, request.role) {
            (Role::Admin, _) => None,
            (Role::Reseller, Role::User) => Some(actor.id),
            _ => return Err(AccountError::Forbidden),
        };

        let username = validate_account_username(&request.username)?.to_string();
        validate_email(&request.email)?;
        validate_password(&request.password)?;

        let hosted = request.role != Role::Admin;
        let domain = match (&request.domain, hosted) {
            (Some(d), true) => Some(normalize_domain(d)?),
            (None, true) => return Err(AccountError::Validation("A domain is required".into())),
            (Some(_), false) => {
                return Err(AccountError::Validation(
                    "Admin accounts do not host domains".into(),
                ))
            }
            (None, false) => None,
        };

        let mut keys = vec![format!("user:{}", username)];
        if let Some(d) = &domain {
            keys.push(format!("domain:{}", d));
        }
        let _reservation = self.reservations.claim(keys).ok_or_else(|| {
            AccountError::Conflict(format!("Account {} is already being created", username))
        })?;

        self.ensure_active(actor.id).await?;

        let package = match &request.package {
            Some(name) => Some(
                queries::find_package_by_name(self.db.pool(), name)
                    .await?
                    .ok_or_else(|| AccountError::Validation(format!("Unknown package: {}", name)))?,
            ),
            None if hosted => {
                return Err(AccountError::Validation("A package is required".into()));
            }
            None => None,
        };

        let password = request.password.clone();
        let cost = self.hash_cost;
        let password_hash =
            tokio::task::spawn_blocking(move || hash_login_password_with_cost(&password, cost))
                .await
                .map_err(|e| AccountError::Internal(e.to_string()))?
                .map_err(|e| AccountError::Internal(e.to_string()))?;

        let php_version = self.host.settings.php_default_version.clone();

        // Dropping `tx` on any early return rolls the rows back.
        let mut tx = self.db.begin().await?;
        let user_id = queries::create_user(
            &mut *tx,
            &NewUser {
                username: &username,
                email: &request.email,
                password_hash: &password_hash,
                role: request.role,
                parent_id,
            },
        )
        .await?;
        if let Some(package) = &package {
            queries::assign_package(&mut *tx, user_id, package.id).await?;
        }
        let domain_id = match &domain {
            Some(name) => {
                let document_root = display(&self.host.paths.public_html(&username));
                Some(
                    queries::create_domain(
                        &mut *tx,
                        &NewDomain {
                            user_id,
                            name,
                            document_root: &document_root,
                            php_version: &php_version,
                        },
                    )
                    .await?,
                )
            }
            None => None,
        };

        let mut state = ProvisionState::default();
        let mut completed = Vec::new();
        let plan = domain.as_deref().map(|d| Provision {
            username: &username,
            email: &request.email,
            domain: d,
            php_version: &php_version,
        });

        if let Some(plan) = &plan {
            for (step, action) in CREATE_ACTIONS {
                debug!(username = %username, step = %step, action, "Provisioning");
                if let Err(e) = self.apply(*step, plan, &mut state).await {
                    warn!(username = %username, step = %step, error = %e, "Provisioning failed, rolling back");
                    self.rollback(plan, &state, &completed).await;
                    return Err(e);
                }
                completed.push(*step);
            }
        }

        if let Err(e) = self
            .finish(tx, actor, &username, domain_id, &state)
            .await
        {
            warn!(username = %username, error = %e, "Metadata commit failed, rolling back");
            if let Some(plan) = &plan {
                self.rollback(plan, &state, &completed).await;
            }
            return Err(e.into());
        }

        info!(
            username = %username,
            role = %request.role,
            domain = domain.as_deref().unwrap_or("-"),
            adopted = state.adopted,
            "Account created"
        );

        Ok(CreatedAccount {
            user: queries::get_user(self.db.pool(), user_id).await?,
            domain,
            adopted_system_user: state.adopted,
        })
    }

    /// Rows that depend on host results, then commit.
    async fn finish(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        actor: &Actor,
        username: &str,
        domain_id: Option<i64>,
        state: &ProvisionState,
    ) -> Result<(), DbError> {
        if let Some(domain_id) = domain_id {
            queries::insert_dns_records(&mut tx, domain_id, &dns_rows(&state.zone_records)).await?;
        }
        queries::log_activity(&mut *tx, Some(actor.id), "account.create", username, None).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply(
        &self,
        step: ProvisionStep,
        plan: &Provision<'_>,
        state: &mut ProvisionState,
    ) -> Result<(), AccountError> {
        let host = &self.host;
        let failed = |e: &dyn fmt::Display| AccountError::Step {
            step,
            message: e.to_string(),
        };

        match step {
            ProvisionStep::PosixUser => match host.users.regular_identity(plan.username) {
                Ok(Some(_)) if host.users.has_public_html(plan.username) => {
                    info!(username = plan.username, "Adopting existing system user");
                    state.adopted = true;
                }
                Ok(Some(_)) | Err(UserError::SystemAccount { .. }) => {
                    return Err(AccountError::Conflict(format!(
                        "System user {} already exists",
                        plan.username
                    )));
                }
                Ok(None) => host.users.create(plan.username).await.map_err(|e| failed(&e))?,
                Err(e) => return Err(failed(&e)),
            },
            ProvisionStep::HomeTree => {
                let home = host.home_on_disk(plan.username);
                for sub in HOME_SUBDIRS {
                    fs::create_dir_all(home.join(sub)).map_err(|e| failed(&e))?;
                }
                apply_rules(&account_manifest(&home)).map_err(|e| failed(&e))?;
                let htaccess = home.join("public_html").join(".htaccess");
                if !htaccess.exists() {
                    atomic_write_config(&htaccess, SECURITY_HTACCESS).map_err(|e| failed(&e))?;
                }
                self.chown_to_user(&home, plan.username, true)
                    .map_err(|e| failed(&e))?;
            }
            ProvisionStep::Vhost => {
                let spec =
                    VhostSpec::for_domain(&host.paths, plan.domain, plan.username, plan.php_version);
                host.vhosts.create(&spec).await.map_err(|e| failed(&e))?;
            }
            ProvisionStep::PhpPool => {
                host.php
                    .create_pool(plan.username, plan.php_version, &IniOverrides::default())
                    .await
                    .map_err(|e| failed(&e))?;
            }
            ProvisionStep::DnsZone => {
                state.zone_records = host
                    .zones
                    .create_default_zone(plan.domain, &host.settings.server_ip)
                    .await
                    .map_err(|e| failed(&e))?;
            }
            ProvisionStep::WebmailVhost => {
                let spec =
                    VhostSpec::webmail(&host.paths, plan.domain, plan.username, plan.php_version);
                host.vhosts.create(&spec).await.map_err(|e| failed(&e))?;
            }
            ProvisionStep::MailDomain => {
                host.mail
                    .add_domain(plan.domain, plan.email)
                    .await
                    .map_err(|e| failed(&e))?;
            }
            ProvisionStep::WelcomePage => {
                let index = host.home_on_disk(plan.username).join("public_html/index.html");
                if !index.exists() {
                    atomic_write_config(&index, &welcome_page(plan.domain)).map_err(|e| failed(&e))?;
                    self.chown_to_user(&index, plan.username, false)
                        .map_err(|e| failed(&e))?;
                    state.welcome_written = true;
                }
            }
        }
        Ok(())
    }

    async fn undo(
        &self,
        step: ProvisionStep,
        plan: &Provision<'_>,
        state: &ProvisionState,
    ) -> Result<(), String> {
        let host = &self.host;
        match step {
            ProvisionStep::PosixUser | ProvisionStep::HomeTree if state.adopted => Ok(()),
            ProvisionStep::PosixUser => {
                if let Err(e) = host.users.kill_all(plan.username).await {
                    debug!(username = plan.username, error = %e, "pkill before userdel failed");
                }
                host.users
                    .delete(plan.username)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            ProvisionStep::HomeTree => host
                .users
                .remove_home(plan.username)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ProvisionStep::Vhost => host
                .vhosts
                .delete_site(plan.domain)
                .await
                .map_err(|e| e.to_string()),
            ProvisionStep::PhpPool => host
                .php
                .delete_pool(plan.username, plan.php_version)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ProvisionStep::DnsZone => host
                .zones
                .delete_zone(plan.domain)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ProvisionStep::WebmailVhost => host
                .vhosts
                .delete_site(&format!("webmail.{}", plan.domain))
                .await
                .map_err(|e| e.to_string()),
            ProvisionStep::MailDomain => host
                .mail
                .remove_domain(plan.domain)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ProvisionStep::WelcomePage if state.welcome_written => {
                let index = host.home_on_disk(plan.username).join("public_html/index.html");
                remove_if_exists(&index).map(|_| ()).map_err(|e| e.to_string())
            }
            ProvisionStep::WelcomePage => Ok(()),
        }
    }

    async fn rollback(&self, plan: &Provision<'_>, state: &ProvisionState, completed: &[ProvisionStep]) {
        for step in completed.iter().rev() {
            let action = describe(UNDO_ACTIONS, *step);
            match self.undo(*step, plan, state).await {
                Ok(()) => debug!(username = plan.username, step = %step, action, "Rolled back"),
                Err(e) => warn!(username = plan.username, step = %step, action, error = %e, "Rollback step failed"),
            }
        }
        info!(username = plan.username, steps = completed.len(), "Provisioning rolled back");
    }

    fn chown_to_user(&self, path: &Path, username: &str, recursive: bool) -> Result<(), PermissionError> {
        if self.host.runner.is_simulated() {
            debug!(path = %path.display(), username, "simulate: skipping chown");
            return Ok(());
        }
        let owner = Ownership::of_user(username)?;
        if recursive {
            chown_tree(path, owner)
        } else {
            chown_path(path, owner)
        }
    }

    // ------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------

    /// Remove an account and everything it owns. Host cleanup is best
    /// effort and reported; a metadata failure aborts before the system
    /// user and home are touched.
    pub async fn delete(&self, actor: &Actor, user_id: i64) -> Result<DeletionReport, AccountError> {
        let user = self.authorised_user(actor, user_id).await?;
        if user.id == actor.id {
            return Err(AccountError::Validation("Cannot delete your own account".into()));
        }
        self.ensure_active(actor.id).await?;

        let pool = self.db.pool();
        let domains = queries::domains_for_user(pool, user.id).await?;
        let mut sites = Vec::new();
        for domain in &domains {
            sites.push(domain.name.clone());
            sites.extend(
                ["webmail", "mail", "ftp"]
                    .iter()
                    .map(|label| format!("{}.{}", label, domain.name)),
            );
            // Subdomain rows hold the label only.
            for sub in queries::subdomains_for_domain(pool, domain.id).await? {
                sites.push(format!("{}.{}", sub.name, domain.name));
            }
        }
        let databases = queries::databases_for_user(pool, user.id).await?;

        let mut report = DeletionReport {
            username: user.username.clone(),
            domains: domains.iter().map(|d| d.name.clone()).collect(),
            ..Default::default()
        };
        debug!(
            username = %user.username,
            domains = domains.len(),
            databases = databases.len(),
            "Tearing down account"
        );

        let hosted = user.role != Role::Admin;
        if hosted {
            self.teardown_host(&user.username, &domains, &sites, &mut report).await;
        }

        let mut tx = self.db.begin().await?;
        queries::delete_user_tree(&mut tx, user.id).await?;
        queries::log_activity(&mut *tx, Some(actor.id), "account.delete", &user.username, None)
            .await?;
        tx.commit().await.map_err(DbError::from)?;

        if hosted {
            if let Err(e) = self.host.users.delete(&user.username).await {
                report.warn("userdel", e);
            }
            if let Err(e) = self.host.users.remove_home(&user.username) {
                report.warn("home removal", e);
            }
        }

        info!(
            username = %user.username,
            domains = report.domains.len(),
            warnings = report.warnings.len(),
            "Account deleted"
        );
        Ok(report)
    }

    async fn teardown_host(
        &self,
        username: &str,
        domains: &[Domain],
        sites: &[String],
        report: &mut DeletionReport,
    ) {
        let host = &self.host;
        let identity = match host.users.lookup(username) {
            Ok(identity) => identity,
            Err(e) => {
                report.warn("user lookup", e);
                None
            }
        };

        for site in sites {
            if let Err(e) = host.vhosts.delete_site(site).await {
                report.warn("vhost", e);
            }
        }
        for domain in domains {
            if let Err(e) = host.zones.delete_zone(&domain.name).await {
                report.warn("dns zone", e);
            }
            if let Err(e) = host.mail.remove_domain(&domain.name).await {
                report.warn("mail domain", e);
            }
        }

        match host.php.delete_user_pools(username) {
            Ok(versions) => {
                for version in versions {
                    if let Some(e) = host.php.restart(&version).await {
                        report.warn("php-fpm restart", e);
                    }
                    report.php_versions_restarted.push(version);
                }
            }
            Err(e) => report.warn("php-fpm pools", e),
        }

        match identity {
            Some(identity) => self.kill_processes(username, identity, report).await,
            None => debug!(username, "No system user, nothing to kill"),
        }

        match host.mysql.drop_account_objects(username).await {
            Ok(cleanup) => report.databases_dropped = cleanup.databases,
            Err(e) => report.warn("mysql", e),
        }
    }

    async fn kill_processes(&self, username: &str, identity: PosixIdentity, report: &mut DeletionReport) {
        let users = &self.host.users;
        for attempt in 1..=2 {
            if let Err(e) = users.kill_all(username).await {
                report.warn("pkill", e);
            }
            tokio::time::sleep(self.kill_grace).await;
            let remaining = users.remaining_processes(identity.uid);
            if remaining.is_empty() {
                return;
            }
            warn!(username, attempt, remaining = remaining.len(), "User processes survived pkill");
        }
        report.warn("processes", "user processes still running before home removal");
    }

    // ------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------

    pub async fn suspend(&self, actor: &Actor, user_id: i64) -> Result<User, AccountError> {
        self.set_active(actor, user_id, false).await
    }

    pub async fn unsuspend(&self, actor: &Actor, user_id: i64) -> Result<User, AccountError> {
        self.set_active(actor, user_id, true).await
    }

    async fn set_active(&self, actor: &Actor, user_id: i64, active: bool) -> Result<User, AccountError> {
        let user = self.authorised_user(actor, user_id).await?;
        if user.id == actor.id {
            return Err(AccountError::Validation("Cannot change your own suspension".into()));
        }
        self.ensure_active(actor.id).await?;

        let action = if active { "account.unsuspend" } else { "account.suspend" };
        let mut tx = self.db.begin().await?;
        queries::set_user_active(&mut *tx, user.id, active).await?;
        queries::log_activity(&mut *tx, Some(actor.id), action, &user.username, None).await?;
        tx.commit().await.map_err(DbError::from)?;

        info!(username = %user.username, active, "Account suspension changed");
        Ok(queries::get_user(self.db.pool(), user.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HostSettings;
    use hp_core::exec::CommandRunner;
    use hp_core::fs::HostPaths;
    use hp_core::web::WebServerKind;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Database,
        runner: CommandRunner,
        accounts: AccountOrchestrator,
        admin: Actor,
    }

    impl Fixture {
        fn root(&self) -> PathBuf {
            self.dir.path().join("root")
        }

        fn exists(&self, rel: &str) -> bool {
            self.root().join(rel).exists()
        }

        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.root().join(rel)).unwrap_or_default()
        }
    }

    fn settings() -> HostSettings {
        settings_for(WebServerKind::Apache)
    }

    fn settings_for(web_server: WebServerKind) -> HostSettings {
        HostSettings {
            web_server,
            php_default_version: "8.2".to_string(),
            server_ip: "203.0.113.10".to_string(),
            nameservers: vec!["ns1.panel.example".to_string(), "ns2.panel.example".to_string()],
            acme_email: None,
        }
    }

    async fn fixture_with(paths: impl FnOnce(PathBuf) -> HostPaths) -> Fixture {
        fixture_for(WebServerKind::Apache, paths).await
    }

    async fn fixture_for(kind: WebServerKind, paths: impl FnOnce(PathBuf) -> HostPaths) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("panel.db")).await.unwrap();
        db.migrate().await.unwrap();
        queries::create_package(
            db.pool(),
            &Package {
                name: "Starter".to_string(),
                max_php_memory: "256M".to_string(),
                max_php_upload: "64M".to_string(),
                max_php_execution_time: 300,
                mail_hourly_limit: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let admin_id = queries::create_user(
            db.pool(),
            &NewUser {
                username: "panel_admin",
                email: "admin@panel.example",
                password_hash: "x",
                role: Role::Admin,
                parent_id: None,
            },
        )
        .await
        .unwrap();

        let runner = CommandRunner::simulated();
        let host = HostContext::new(runner.clone(), paths(dir.path().join("root")), settings_for(kind));
        let accounts = AccountOrchestrator::new(db.clone(), host)
            .with_hash_cost(4)
            .with_kill_grace(Duration::ZERO);
        Fixture {
            dir,
            db,
            runner,
            accounts,
            admin: Actor::new(admin_id, "panel_admin", Role::Admin),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(HostPaths::rebased).await
    }

    fn request(username: &str, domain: &str) -> CreateAccount {
        CreateAccount {
            username: username.to_string(),
            email: format!("{}@owner.example", username),
            password: "Correct-Horse-9".to_string(),
            domain: Some(domain.to_string()),
            package: Some("Starter".to_string()),
            role: Role::User,
        }
    }

    fn position(journal: &[String], needle: &str) -> usize {
        journal
            .iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("{} not in journal: {:#?}", needle, journal))
    }

    #[test]
    fn test_every_create_has_an_undo() {
        let creates: BTreeSet<ProvisionStep> = CREATE_ACTIONS.iter().map(|(s, _)| *s).collect();
        let undos: BTreeSet<ProvisionStep> = UNDO_ACTIONS.iter().map(|(s, _)| *s).collect();
        assert_eq!(creates, undos);
        assert_eq!(creates.len(), CREATE_ACTIONS.len());

        let forward: Vec<ProvisionStep> = CREATE_ACTIONS.iter().map(|(s, _)| *s).collect();
        let mut backward: Vec<ProvisionStep> = UNDO_ACTIONS.iter().map(|(s, _)| *s).collect();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[tokio::test]
    async fn test_create_materialises_every_artefact() {
        let f = fixture().await;
        let created = f
            .accounts
            .create(&f.admin, request("alice", "alice.example"))
            .await
            .unwrap();
        assert_eq!(created.user.username, "alice");
        assert!(!created.adopted_system_user);

        assert!(f.exists("home/alice/public_html/index.html"));
        assert!(f.exists("home/alice/public_html/.htaccess"));
        for sub in HOME_SUBDIRS {
            assert!(f.exists(&format!("home/alice/{}", sub)));
        }
        assert!(f.exists("etc/apache2/sites-available/alice.example.conf"));
        assert!(f.exists("etc/apache2/sites-available/webmail.alice.example.conf"));
        assert!(f.exists("etc/php/8.2/fpm/pool.d/alice.conf"));
        assert!(f.exists("etc/bind/zones/db.alice.example"));
        assert!(f.read("etc/postfix/vdomains").contains("alice.example OK"));

        let domain = queries::find_domain_by_name(f.db.pool(), "alice.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(domain.document_root, "/home/alice/public_html");
        let records = queries::dns_records_for_domain(f.db.pool(), domain.id).await.unwrap();
        assert!(records.iter().any(|r| r.record_type == "MX"));

        let journal = f.runner.journal();
        assert!(position(&journal, "useradd") < position(&journal, "a2ensite alice.example"));
        assert!(position(&journal, "a2ensite alice.example") < position(&journal, "php-fpm8.2 -t"));
    }

    #[tokio::test]
    async fn test_create_twice_conflicts_and_keeps_first() {
        let f = fixture().await;
        f.accounts
            .create(&f.admin, request("alice", "alice.example"))
            .await
            .unwrap();
        let err = f
            .accounts
            .create(&f.admin, request("alice", "other.example"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert!(f.exists("etc/apache2/sites-available/alice.example.conf"));
        assert!(f.exists("home/alice/public_html/index.html"));
        assert!(!f.exists("etc/apache2/sites-available/other.example.conf"));
    }

    #[tokio::test]
    async fn test_create_delete_create_round_trip() {
        let f = fixture().await;
        let created = f
            .accounts
            .create(&f.admin, request("alice", "alice.example"))
            .await
            .unwrap();

        let report = f.accounts.delete(&f.admin, created.user.id).await.unwrap();
        assert_eq!(report.domains, vec!["alice.example".to_string()]);
        assert_eq!(report.php_versions_restarted, vec!["8.2".to_string()]);

        assert!(!f.exists("home/alice"));
        assert!(!f.exists("etc/apache2/sites-available/alice.example.conf"));
        assert!(!f.exists("etc/apache2/sites-available/webmail.alice.example.conf"));
        assert!(!f.exists("etc/php/8.2/fpm/pool.d/alice.conf"));
        assert!(!f.exists("etc/bind/zones/db.alice.example"));
        assert!(!f.read("etc/postfix/vdomains").contains("alice.example"));
        assert!(queries::find_user_by_username(f.db.pool(), "alice")
            .await
            .unwrap()
            .is_none());

        let journal = f.runner.journal();
        let restart = position(&journal, "systemctl restart php8.2-fpm");
        let kill = position(&journal, "pkill -9 -u alice");
        let userdel = position(&journal, "userdel -r alice");
        assert!(restart < kill && kill < userdel);

        let again = f
            .accounts
            .create(&f.admin, request("alice", "alice.example"))
            .await
            .unwrap();
        assert!(!again.adopted_system_user);
        assert!(f.exists("home/alice/public_html/index.html"));
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_everything() {
        // A regular file where the zones directory should be makes the zone
        // write fail after the vhost and pool already exist.
        let f = fixture_with(|root| {
            fs::create_dir_all(&root).unwrap();
            fs::write(root.join("blocker"), "").unwrap();
            HostPaths::rebased(root).with_zones_dir("/blocker/zones")
        })
        .await;

        let err = f
            .accounts
            .create(&f.admin, request("alice", "alice.example"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AccountError::Step {
                step: ProvisionStep::DnsZone,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Internal);

        assert!(!f.exists("home/alice"));
        assert!(!f.exists("etc/apache2/sites-available/alice.example.conf"));
        assert!(!f.exists("etc/php/8.2/fpm/pool.d/alice.conf"));
        assert!(queries::find_user_by_username(f.db.pool(), "alice")
            .await
            .unwrap()
            .is_none());
        assert!(queries::find_domain_by_name(f.db.pool(), "alice.example")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rejected_vhost_rolls_back_without_stray_sites() {
        for (kind, test_cmd, root) in [
            (WebServerKind::Apache, "apache2ctl configtest", "etc/apache2"),
            (WebServerKind::Nginx, "nginx -t", "etc/nginx"),
        ] {
            let f = fixture_for(kind, HostPaths::rebased).await;
            f.runner.fail_commands_starting_with(test_cmd);

            let err = f
                .accounts
                .create(&f.admin, request("alice", "alice.example"))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AccountError::Step {
                    step: ProvisionStep::Vhost,
                    ..
                }
            ));

            for site in ["alice.example", "webmail.alice.example"] {
                assert!(!f.exists(&format!("{root}/sites-available/{site}.conf")), "{kind}: {site}");
                assert!(
                    fs::symlink_metadata(f.root().join(format!("{root}/sites-enabled/{site}.conf"))).is_err(),
                    "{kind}: {site} still enabled"
                );
            }
            assert!(!f.exists("home/alice"));
            assert!(queries::find_user_by_username(f.db.pool(), "alice")
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn test_rejected_webmail_vhost_undoes_main_site() {
        let f = fixture_for(WebServerKind::Nginx, HostPaths::rebased).await;
        // The main site is already enabled when the webmail file cannot be
        // written: a non-empty directory sits where it goes.
        fs::create_dir_all(f.root().join("etc/nginx/sites-available/webmail.alice.example.conf/x")).unwrap();

        let err = f
            .accounts
            .create(&f.admin, request("alice", "alice.example"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AccountError::Step {
                step: ProvisionStep::WebmailVhost,
                ..
            }
        ));
        assert!(!f.exists("etc/nginx/sites-available/alice.example.conf"));
        assert!(fs::symlink_metadata(f.root().join("etc/nginx/sites-enabled/alice.example.conf")).is_err());
        assert!(fs::symlink_metadata(f.root().join("etc/nginx/sites-enabled/webmail.alice.example.conf")).is_err());
        assert!(!f.exists("etc/php/8.2/fpm/pool.d/alice.conf"));
    }

    #[tokio::test]
    async fn test_concurrent_same_name_creation() {
        let f = fixture().await;
        let (a, b) = tokio::join!(
            f.accounts.create(&f.admin, request("bob", "bob.example")),
            f.accounts.create(&f.admin, request("bob", "bob.example")),
        );
        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let err = a.err().or(b.err()).unwrap();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert_eq!(f.read("etc/postfix/vdomains").matches("bob.example OK").count(), 1);
        assert_eq!(queries::list_users(f.db.pool()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_existing_system_user_without_site_conflicts() {
        let f = fixture().await;
        fs::create_dir_all(f.root().join("home/carol")).unwrap();
        let err = f
            .accounts
            .create(&f.admin, request("carol", "carol.example"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        // The pre-existing home is not ours to remove.
        assert!(f.exists("home/carol"));
    }

    #[tokio::test]
    async fn test_existing_system_user_with_site_is_adopted() {
        let f = fixture().await;
        fs::create_dir_all(f.root().join("home/dave/public_html")).unwrap();
        fs::write(f.root().join("home/dave/public_html/index.html"), "mine").unwrap();

        let created = f
            .accounts
            .create(&f.admin, request("dave", "dave.example"))
            .await
            .unwrap();
        assert!(created.adopted_system_user);
        assert_eq!(f.read("home/dave/public_html/index.html"), "mine");
        assert!(!f.runner.journal().iter().any(|l| l.starts_with("useradd")));
    }

    #[tokio::test]
    async fn test_validation_happens_before_side_effects() {
        let f = fixture().await;
        for (username, domain) in [("ab", "ok.example"), ("mysql", "ok.example"), ("erin", "-bad.example"), ("erin", "a..example")] {
            let err = f
                .accounts
                .create(&f.admin, request(username, domain))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{} {}", username, domain);
        }
        let mut unknown = request("erin", "erin.example");
        unknown.package = Some("Gold".to_string());
        let err = f.accounts.create(&f.admin, unknown).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(f.runner.journal().is_empty());
    }

    #[tokio::test]
    async fn test_admin_account_has_no_host_artefacts() {
        let f = fixture().await;
        let created = f
            .accounts
            .create(
                &f.admin,
                CreateAccount {
                    username: "ops".to_string(),
                    email: "ops@panel.example".to_string(),
                    password: "Correct-Horse-9".to_string(),
                    domain: None,
                    package: None,
                    role: Role::Admin,
                },
            )
            .await
            .unwrap();
        assert_eq!(created.user.role, Role::Admin);
        assert!(f.runner.journal().is_empty());
        assert!(!f.exists("home/ops"));
    }

    #[tokio::test]
    async fn test_reseller_tenancy_and_suspension() {
        let f = fixture().await;
        let reseller = f
            .accounts
            .create(
                &f.admin,
                CreateAccount {
                    role: Role::Reseller,
                    ..request("rita", "rita.example")
                },
            )
            .await
            .unwrap();
        let rita = Actor::from(&reseller.user);

        let client = f
            .accounts
            .create(&rita, request("carl", "carl.example"))
            .await
            .unwrap();
        assert_eq!(client.user.parent_id, Some(rita.id));

        let stranger = f
            .accounts
            .create(&f.admin, request("sam", "sam.example"))
            .await
            .unwrap();

        let listed = f.accounts.list(&rita).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].username, "carl");

        let err = f.accounts.get(&rita, stranger.user.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = f.accounts.get(&rita, 9999).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = f.accounts.get(&f.admin, 9999).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = f
            .accounts
            .create(
                &rita,
                CreateAccount {
                    role: Role::Reseller,
                    ..request("ralph", "ralph.example")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let suspended = f.accounts.suspend(&f.admin, rita.id).await.unwrap();
        assert!(!suspended.is_active);
        let err = f.accounts.ensure_active(rita.id).await.unwrap_err();
        assert!(matches!(err, AccountError::Suspended(_)));
        let err = f
            .accounts
            .create(&rita, request("cleo", "cleo.example"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let restored = f.accounts.unsuspend(&f.admin, rita.id).await.unwrap();
        assert!(restored.is_active);
        // Static content keeps being served while suspended.
        assert!(f.exists("etc/apache2/sites-available/rita.example.conf"));
    }
}
