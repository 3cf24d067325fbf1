//! OpenDKIM lookup tables.
//!
//! Each signing domain owns exactly one line in each of the three tables:
//!
//! - KeyTable: `<selector>._domainkey.<domain> <domain>:<selector>:<keydir>/<domain>/<selector>.private`
//! - SigningTable: `*@<domain> <selector>._domainkey.<domain>`
//! - TrustedHosts: `<domain>`
//!
//! Lines belonging to other domains, and hand-written lines such as
//! `127.0.0.1`, are left alone.

use std::path::PathBuf;

use crate::fs::atomic::AtomicWriteError;
use crate::fs::lines::{append_line_if_absent, count_lines_where, line_key, remove_lines_where};
use crate::fs::HostPaths;

pub const DKIM_SELECTOR: &str = "default";
pub const OPENDKIM_DIR: &str = "/etc/opendkim";
pub const KEY_DIR: &str = "/etc/opendkim/keys";

const TABLE_MODE: u32 = 0o644;

/// The three table lines for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimEntry {
    pub domain: String,
    pub selector: String,
}

impl DkimEntry {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            selector: DKIM_SELECTOR.to_string(),
        }
    }

    pub fn record_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }

    pub fn private_key_path(&self) -> PathBuf {
        PathBuf::from(KEY_DIR)
            .join(&self.domain)
            .join(format!("{}.private", self.selector))
    }

    pub fn key_table_line(&self) -> String {
        format!(
            "{} {}:{}:{}",
            self.record_name(),
            self.domain,
            self.selector,
            self.private_key_path().display()
        )
    }

    pub fn signing_table_line(&self) -> String {
        format!("*@{} {}", self.domain, self.record_name())
    }

    pub fn trusted_hosts_line(&self) -> String {
        self.domain.clone()
    }
}

/// Union-of-lines access to KeyTable, SigningTable and TrustedHosts.
#[derive(Debug, Clone)]
pub struct DkimTables {
    paths: HostPaths,
}

impl DkimTables {
    pub fn new(paths: HostPaths) -> Self {
        Self { paths }
    }

    fn table(&self, name: &str) -> PathBuf {
        self.paths.resolve(PathBuf::from(OPENDKIM_DIR).join(name))
    }

    fn key_table(&self) -> PathBuf {
        self.table("KeyTable")
    }

    fn signing_table(&self) -> PathBuf {
        self.table("SigningTable")
    }

    fn trusted_hosts(&self) -> PathBuf {
        self.table("TrustedHosts")
    }

    fn owns_key_line(line: &str, domain: &str) -> bool {
        line_key(line).is_some_and(|k| k.ends_with(&format!("._domainkey.{}", domain)))
    }

    fn owns_signing_line(line: &str, domain: &str) -> bool {
        line_key(line) == Some(format!("*@{}", domain).as_str())
    }

    fn owns_trusted_line(line: &str, domain: &str) -> bool {
        line_key(line) == Some(domain)
    }

    /// Add the domain's line to each table where it is missing. Returns
    /// whether any table changed.
    pub fn add(&self, entry: &DkimEntry) -> Result<bool, AtomicWriteError> {
        let domain = entry.domain.as_str();
        let mut changed = append_line_if_absent(
            &self.key_table(),
            &entry.key_table_line(),
            TABLE_MODE,
            |l| Self::owns_key_line(l, domain),
        )?;
        changed |= append_line_if_absent(
            &self.signing_table(),
            &entry.signing_table_line(),
            TABLE_MODE,
            |l| Self::owns_signing_line(l, domain),
        )?;
        changed |= append_line_if_absent(
            &self.trusted_hosts(),
            &entry.trusted_hosts_line(),
            TABLE_MODE,
            |l| Self::owns_trusted_line(l, domain),
        )?;
        Ok(changed)
    }

    /// Drop the domain's lines from all three tables. Returns lines removed.
    pub fn remove(&self, domain: &str) -> Result<usize, AtomicWriteError> {
        let mut removed =
            remove_lines_where(&self.key_table(), TABLE_MODE, |l| Self::owns_key_line(l, domain))?;
        removed += remove_lines_where(&self.signing_table(), TABLE_MODE, |l| {
            Self::owns_signing_line(l, domain)
        })?;
        removed += remove_lines_where(&self.trusted_hosts(), TABLE_MODE, |l| {
            Self::owns_trusted_line(l, domain)
        })?;
        Ok(removed)
    }

    /// Exactly one line for `domain` in every table.
    pub fn is_consistent(&self, domain: &str) -> Result<bool, std::io::Error> {
        let keys = count_lines_where(&self.key_table(), |l| Self::owns_key_line(l, domain))?;
        let signing =
            count_lines_where(&self.signing_table(), |l| Self::owns_signing_line(l, domain))?;
        let trusted =
            count_lines_where(&self.trusted_hosts(), |l| Self::owns_trusted_line(l, domain))?;
        Ok(keys == 1 && signing == 1 && trusted == 1)
    }
}
