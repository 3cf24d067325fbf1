//! Postfix virtual tables, the Dovecot passwd-file and per-domain spools.
//!
//! Line formats:
//!
//! - `vdomains`: `<domain> OK`
//! - `virtual`: `postmaster@<domain> <target>`
//! - `vmailbox`: `<local>@<domain> <domain>/<local>/Maildir/`
//! - Dovecot `users`: `<local>@<domain>:<hash>:5000:5000::<spool>/<domain>/<local>::[quota]`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::dkim::{DkimError, DkimKeys};
use super::opendkim::{DkimEntry, DkimTables};
use super::password::{hash_password, PasswordError};
use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::fs::atomic::AtomicWriteError;
use crate::fs::lines::{append_line_if_absent, count_lines_where, line_key, remove_lines_where};
use crate::fs::paths::display;
use crate::fs::permissions::{chown_path, chown_tree, set_mode, Ownership, PermissionError};
use crate::fs::HostPaths;
use crate::security::input::{validate_domain, validate_email, validate_local_part, ValidationError};
use crate::service::ServiceManager;

pub const POSTFIX_DIR: &str = "/etc/postfix";
pub const DOVECOT_USERS_FILE: &str = "/etc/dovecot/users";
pub const MAIL_SPOOL_ROOT: &str = "/var/mail/vhosts";

pub const VMAIL_UID: u32 = 5000;
pub const VMAIL_GID: u32 = 5000;
const VMAIL_USER: &str = "vmail";

const TABLE_MODE: u32 = 0o644;
const USERS_MODE: u32 = 0o640;
const MAILDIR_MODE: u32 = 0o700;

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Mail domain not registered: {0}")]
    UnknownDomain(String),
    #[error("Failed to write mail table: {0}")]
    Write(#[from] AtomicWriteError),
    #[error(transparent)]
    Dkim(#[from] DkimError),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Command(#[from] RunnerError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Postfix lookup tables compiled with `postmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Domains,
    Aliases,
    Mailboxes,
}

impl Table {
    fn file_name(self) -> &'static str {
        match self {
            Self::Domains => "vdomains",
            Self::Aliases => "virtual",
            Self::Mailboxes => "vmailbox",
        }
    }

    fn logical_path(self) -> PathBuf {
        PathBuf::from(POSTFIX_DIR).join(self.file_name())
    }
}

/// What `add_domain` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainRegistration {
    pub tables_changed: bool,
    pub dkim_generated: bool,
    pub dkim_tables_changed: bool,
}

fn belongs_to_domain(key: &str, domain: &str) -> bool {
    key.rsplit_once('@').is_some_and(|(_, d)| d == domain)
}

fn dovecot_user(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    trimmed.split(':').next()
}

/// Registers domains and mailboxes with Postfix, Dovecot and OpenDKIM.
#[derive(Debug, Clone)]
pub struct MailRegistrar {
    runner: CommandRunner,
    paths: HostPaths,
    services: ServiceManager,
    keys: DkimKeys,
    dkim_tables: DkimTables,
}

impl MailRegistrar {
    pub fn new(runner: CommandRunner, paths: HostPaths) -> Self {
        Self {
            services: ServiceManager::new(runner.clone()),
            keys: DkimKeys::new(runner.clone(), paths.clone()),
            dkim_tables: DkimTables::new(paths.clone()),
            runner,
            paths,
        }
    }

    fn table(&self, table: Table) -> PathBuf {
        self.paths.resolve(table.logical_path())
    }

    fn users_file(&self) -> PathBuf {
        self.paths.resolve(DOVECOT_USERS_FILE)
    }

    /// Logical spool directory for a domain.
    pub fn spool_dir(domain: &str) -> PathBuf {
        PathBuf::from(MAIL_SPOOL_ROOT).join(domain)
    }

    /// Logical Maildir of one mailbox.
    pub fn maildir(local: &str, domain: &str) -> PathBuf {
        Self::spool_dir(domain).join(local).join("Maildir")
    }

    pub fn is_registered(&self, domain: &str) -> Result<bool, MailError> {
        let count = count_lines_where(&self.table(Table::Domains), |l| line_key(l) == Some(domain))?;
        Ok(count > 0)
    }

    pub fn has_mailbox(&self, local: &str, domain: &str) -> Result<bool, MailError> {
        let address = format!("{}@{}", local, domain);
        let count = count_lines_where(&self.users_file(), |l| dovecot_user(l) == Some(address.as_str()))?;
        Ok(count > 0)
    }

    async fn postmap(&self, table: Table) -> Result<(), MailError> {
        let spec = CommandSpec::new("postmap").arg(display(&table.logical_path()));
        self.runner.run_checked(&spec).await?;
        debug!(table = table.file_name(), "Compiled lookup table");
        Ok(())
    }

    fn vmail_owner(&self) -> Result<Option<Ownership>, MailError> {
        if self.runner.is_simulated() {
            return Ok(None);
        }
        Ok(Some(Ownership::of(VMAIL_USER, VMAIL_USER)?))
    }

    /// Register `domain` for virtual delivery with `postmaster` as the
    /// postmaster alias target. Running it twice changes nothing.
    pub async fn add_domain(
        &self,
        domain: &str,
        postmaster: &str,
    ) -> Result<DomainRegistration, MailError> {
        validate_domain(domain)?;
        validate_email(postmaster)?;

        let mut registration = DomainRegistration::default();

        let domains_changed = append_line_if_absent(
            &self.table(Table::Domains),
            &format!("{} OK", domain),
            TABLE_MODE,
            |l| line_key(l) == Some(domain),
        )?;
        let alias = format!("postmaster@{}", domain);
        let aliases_changed = append_line_if_absent(
            &self.table(Table::Aliases),
            &format!("{} {}", alias, postmaster),
            TABLE_MODE,
            |l| line_key(l) == Some(alias.as_str()),
        )?;

        let spool = self.paths.resolve(Self::spool_dir(domain));
        fs::create_dir_all(&spool)?;
        if let Some(owner) = self.vmail_owner()? {
            chown_path(&spool, owner)?;
        }

        if domains_changed {
            self.postmap(Table::Domains).await?;
        }
        if aliases_changed {
            self.postmap(Table::Aliases).await?;
        }
        registration.tables_changed = domains_changed || aliases_changed;

        registration.dkim_generated = self.keys.ensure_key(domain).await?;
        registration.dkim_tables_changed = self.dkim_tables.add(&DkimEntry::new(domain))?;

        if registration.tables_changed {
            self.services.reload_lenient("postfix").await;
        }
        if registration.dkim_generated || registration.dkim_tables_changed {
            self.services.reload_lenient("opendkim").await;
        }

        info!(
            domain,
            tables_changed = registration.tables_changed,
            dkim_generated = registration.dkim_generated,
            "Mail domain registered"
        );
        Ok(registration)
    }

    /// Remove every trace of `domain`: table lines, mailboxes, DKIM keys and
    /// the spool. Missing pieces are not an error. Returns whether anything
    /// was removed.
    pub async fn remove_domain(&self, domain: &str) -> Result<bool, MailError> {
        validate_domain(domain)?;

        let domains = remove_lines_where(&self.table(Table::Domains), TABLE_MODE, |l| {
            line_key(l) == Some(domain)
        })?;
        let aliases = remove_lines_where(&self.table(Table::Aliases), TABLE_MODE, |l| {
            line_key(l).is_some_and(|k| belongs_to_domain(k, domain))
        })?;
        let mailboxes = remove_lines_where(&self.table(Table::Mailboxes), TABLE_MODE, |l| {
            line_key(l).is_some_and(|k| belongs_to_domain(k, domain))
        })?;
        let users = remove_lines_where(&self.users_file(), USERS_MODE, |l| {
            dovecot_user(l).is_some_and(|u| belongs_to_domain(u, domain))
        })?;

        for (table, removed) in [
            (Table::Domains, domains),
            (Table::Aliases, aliases),
            (Table::Mailboxes, mailboxes),
        ] {
            if removed > 0 {
                self.postmap(table).await?;
            }
        }

        let dkim_lines = self.dkim_tables.remove(domain)?;
        let dkim_key = self.keys.delete_key(domain)?;

        let spool = self.paths.resolve(Self::spool_dir(domain));
        let spool_removed = match fs::remove_dir_all(&spool) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let removed = domains + aliases + mailboxes + users + dkim_lines > 0 || dkim_key || spool_removed;
        if removed {
            self.services.reload_lenient("postfix").await;
            self.services.reload_lenient("dovecot").await;
            self.services.reload_lenient("opendkim").await;
            info!(domain, mailboxes = users, "Mail domain removed");
        } else {
            debug!(domain, "Mail domain was not registered");
        }
        Ok(removed)
    }

    /// Create or update a mailbox. The password is hashed by the mail
    /// server's utility; an existing entry for the address is replaced so
    /// this doubles as a password change. Returns whether the mailbox is new.
    pub async fn add_mailbox(
        &self,
        local: &str,
        domain: &str,
        password: &str,
        quota_mb: Option<u64>,
    ) -> Result<bool, MailError> {
        validate_local_part(local)?;
        validate_domain(domain)?;
        if !self.is_registered(domain)? {
            return Err(MailError::UnknownDomain(domain.to_string()));
        }

        let address = format!("{}@{}", local, domain);
        let hash = hash_password(password)?;

        let maildir_logical = Self::maildir(local, domain);
        let maildir = self.paths.resolve(&maildir_logical);
        for sub in ["cur", "new", "tmp"] {
            fs::create_dir_all(maildir.join(sub))?;
        }
        let mailbox_root = maildir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| maildir.clone());
        for dir in [&mailbox_root, &maildir] {
            set_mode(dir, MAILDIR_MODE)?;
        }
        for sub in ["cur", "new", "tmp"] {
            set_mode(&maildir.join(sub), MAILDIR_MODE)?;
        }
        if let Some(owner) = self.vmail_owner()? {
            chown_tree(&mailbox_root, owner)?;
        }

        let vmailbox_changed = append_line_if_absent(
            &self.table(Table::Mailboxes),
            &format!("{} {}/{}/Maildir/", address, domain, local),
            TABLE_MODE,
            |l| line_key(l) == Some(address.as_str()),
        )?;

        let home = display(&Self::spool_dir(domain).join(local));
        let mut entry = format!(
            "{}:{}:{}:{}::{}::",
            address, hash, VMAIL_UID, VMAIL_GID, home
        );
        if let Some(quota) = quota_mb.filter(|q| *q > 0) {
            entry.push_str(&format!("userdb_quota_rule=*:storage={}M", quota));
        }

        let users = self.users_file();
        let replaced = remove_lines_where(&users, USERS_MODE, |l| {
            dovecot_user(l) == Some(address.as_str())
        })?;
        append_line_if_absent(&users, &entry, USERS_MODE, |l| {
            dovecot_user(l) == Some(address.as_str())
        })?;
        if !self.runner.is_simulated() {
            match Ownership::of("root", "dovecot") {
                Ok(owner) => chown_path(&users, owner)?,
                Err(e) => warn!(error = %e, "Could not hand users file to dovecot group"),
            }
        }

        if vmailbox_changed {
            self.postmap(Table::Mailboxes).await?;
            self.services.reload_lenient("postfix").await;
        }

        let created = replaced == 0;
        info!(address = %address, created, "Mailbox written");
        Ok(created)
    }

    /// Drop a mailbox's table lines and, when asked, its Maildir.
    pub async fn remove_mailbox(
        &self,
        local: &str,
        domain: &str,
        delete_maildir: bool,
    ) -> Result<bool, MailError> {
        validate_local_part(local)?;
        validate_domain(domain)?;
        let address = format!("{}@{}", local, domain);

        let mailboxes = remove_lines_where(&self.table(Table::Mailboxes), TABLE_MODE, |l| {
            line_key(l) == Some(address.as_str())
        })?;
        let users = remove_lines_where(&self.users_file(), USERS_MODE, |l| {
            dovecot_user(l) == Some(address.as_str())
        })?;

        if delete_maildir {
            let dir = self.paths.resolve(Self::spool_dir(domain).join(local));
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if mailboxes > 0 {
            self.postmap(Table::Mailboxes).await?;
            self.services.reload_lenient("postfix").await;
        }
        if users > 0 {
            self.services.reload_lenient("dovecot").await;
        }

        let removed = mailboxes + users > 0;
        if removed {
            info!(address = %address, "Mailbox removed");
        }
        Ok(removed)
    }

    /// The DKIM TXT record to publish, if a key exists.
    pub fn dkim_record(&self, domain: &str) -> Result<Option<String>, MailError> {
        Ok(self.keys.dns_record(domain)?)
    }

    pub fn dkim_consistent(&self, domain: &str) -> Result<bool, MailError> {
        Ok(self.dkim_tables.is_consistent(domain)?)
    }
}
