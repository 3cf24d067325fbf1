use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cert::{CertError, CertificateInfo, SslStatus};
use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::fs::paths::display;
use crate::fs::HostPaths;
use crate::security::input::{validate_domain, ValidationError};
use crate::web::{TlsPaths, VhostDriver, VhostError, VhostSpec, SYSTEM_WEBROOT};

pub const ACME_LIVE_DIR: &str = "/etc/letsencrypt/live";

/// Subdomains every account domain gets a vhost and certificate slot for.
pub const STANDARD_SUBDOMAINS: [&str; 4] = ["www", "mail", "webmail", "ftp"];

#[derive(Debug, Error)]
pub enum SslError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Certificate(#[from] CertError),
    #[error(transparent)]
    Command(#[from] RunnerError),
    #[error(transparent)]
    Vhost(#[from] VhostError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Where HTTP-01 challenge files for an FQDN are served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FqdnRole {
    /// An account's main domain, served from the owner's `public_html`.
    Main { owner: String },
    /// A user subdomain with its own document root.
    Subdomain { document_root: PathBuf },
    /// `mail`, `webmail` and `ftp`, answered from the shared webroot.
    System,
}

impl FqdnRole {
    /// Role of `fqdn` under an account's `domain`, treating `www` as part of
    /// the main site and the remaining standard subdomains as system names.
    pub fn classify(fqdn: &str, domain: &str, owner: &str) -> Option<Self> {
        if fqdn == domain || fqdn == format!("www.{}", domain) {
            return Some(Self::Main {
                owner: owner.to_string(),
            });
        }
        let label = fqdn.strip_suffix(domain)?.strip_suffix('.')?;
        if STANDARD_SUBDOMAINS.contains(&label) {
            Some(Self::System)
        } else {
            None
        }
    }

    /// Logical webroot for challenge files.
    pub fn webroot(&self, paths: &HostPaths) -> PathBuf {
        match self {
            Self::Main { owner } => paths.public_html(owner),
            Self::Subdomain { document_root } => document_root.clone(),
            Self::System => PathBuf::from(SYSTEM_WEBROOT),
        }
    }

    fn wants_www(&self) -> bool {
        matches!(self, Self::Main { .. })
    }
}

/// What the panel shows for one FQDN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateStatus {
    pub fqdn: String,
    pub issuer: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub status: SslStatus,
    pub status_detail: Option<String>,
    /// Parent domain whose certificate covers this name.
    pub covered_by: Option<String>,
}

impl CertificateStatus {
    fn none(fqdn: &str) -> Self {
        Self {
            fqdn: fqdn.to_string(),
            issuer: None,
            not_before: None,
            not_after: None,
            status: SslStatus::None,
            status_detail: None,
            covered_by: None,
        }
    }

    fn from_info(fqdn: &str, info: &CertificateInfo, now: DateTime<Utc>) -> Self {
        Self {
            fqdn: fqdn.to_string(),
            issuer: Some(info.issuer.clone()),
            not_before: Some(info.not_before),
            not_after: Some(info.not_after),
            status: info.status_at(now),
            status_detail: None,
            covered_by: None,
        }
    }
}

fn parent_of(fqdn: &str) -> Option<&str> {
    let (_, parent) = fqdn.split_once('.')?;
    // A bare TLD never has a certificate of its own.
    parent.contains('.').then_some(parent)
}

/// Certificates in the ACME client's live tree and the HTTPS vhosts using them.
#[derive(Debug, Clone)]
pub struct SslManager {
    runner: CommandRunner,
    paths: HostPaths,
    vhosts: VhostDriver,
    acme_email: Option<String>,
}

impl SslManager {
    pub fn new(
        runner: CommandRunner,
        paths: HostPaths,
        vhosts: VhostDriver,
        acme_email: Option<String>,
    ) -> Self {
        Self {
            runner,
            paths,
            vhosts,
            acme_email,
        }
    }

    /// Logical `<live>/<fqdn>/fullchain.pem`.
    pub fn certificate_path(fqdn: &str) -> PathBuf {
        PathBuf::from(ACME_LIVE_DIR).join(fqdn).join("fullchain.pem")
    }

    /// Parse the FQDN's own certificate, if one is on disk.
    pub fn read_certificate(&self, fqdn: &str) -> Result<Option<CertificateInfo>, SslError> {
        let path = self.paths.resolve(Self::certificate_path(fqdn));
        match fs::read_to_string(&path) {
            Ok(pem) => Ok(Some(CertificateInfo::from_pem(&pem)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn status(&self, fqdn: &str) -> Result<CertificateStatus, SslError> {
        self.status_at(fqdn, Utc::now())
    }

    /// Own certificate first, then the parent's when its SANs cover `fqdn`.
    pub fn status_at(&self, fqdn: &str, now: DateTime<Utc>) -> Result<CertificateStatus, SslError> {
        validate_domain(fqdn)?;

        if let Some(info) = self.read_certificate(fqdn)? {
            return Ok(CertificateStatus::from_info(fqdn, &info, now));
        }

        if let Some(parent) = parent_of(fqdn) {
            match self.read_certificate(parent) {
                Ok(Some(info)) if info.covers(fqdn) => {
                    let mut status = CertificateStatus::from_info(fqdn, &info, now);
                    status.status_detail = Some(format!("Covered by the certificate for {}", parent));
                    status.covered_by = Some(parent.to_string());
                    return Ok(status);
                }
                Ok(_) => {}
                Err(e) => warn!(fqdn, parent, error = %e, "Unreadable parent certificate"),
            }
        }

        Ok(CertificateStatus::none(fqdn))
    }

    /// Status of a domain, its standard subdomains and any extra names.
    pub fn list(&self, domain: &str, extra: &[String]) -> Result<Vec<CertificateStatus>, SslError> {
        let now = Utc::now();
        let mut names = vec![domain.to_string()];
        names.extend(STANDARD_SUBDOMAINS.iter().map(|s| format!("{}.{}", s, domain)));
        names.extend(extra.iter().cloned());
        names
            .iter()
            .map(|name| self.status_at(name, now))
            .collect()
    }

    fn certbot(&self, verb: &str) -> CommandSpec {
        CommandSpec::new("certbot")
            .arg(verb)
            .args(["--non-interactive"])
    }

    /// Obtain a certificate over HTTP-01, then install the HTTPS vhost.
    pub async fn issue(
        &self,
        fqdn: &str,
        role: &FqdnRole,
        vhost: &VhostSpec,
    ) -> Result<CertificateStatus, SslError> {
        validate_domain(fqdn)?;
        let webroot = role.webroot(&self.paths);

        let mut spec = self
            .certbot("certonly")
            .args(["--agree-tos", "--keep-until-expiring", "--webroot", "-w"])
            .arg(display(&webroot))
            .args(["--cert-name", fqdn, "-d", fqdn]);
        if role.wants_www() && !fqdn.starts_with("www.") {
            spec = spec.arg("-d").arg(format!("www.{}", fqdn));
        }
        spec = match &self.acme_email {
            Some(email) => spec.args(["-m", email.as_str()]),
            None => spec.arg("--register-unsafely-without-email"),
        };
        self.runner.run_checked(&spec).await?;

        self.vhosts
            .create_ssl(vhost, TlsPaths::letsencrypt(fqdn))
            .await?;

        info!(fqdn, webroot = %webroot.display(), "Certificate issued");
        self.status(fqdn)
    }

    /// Renew in place; the vhosts already point at the live paths.
    pub async fn renew(&self, fqdn: &str) -> Result<CertificateStatus, SslError> {
        validate_domain(fqdn)?;
        let spec = self.certbot("renew").args(["--cert-name", fqdn]);
        self.runner.run_checked(&spec).await?;
        if let Err(e) = self.vhosts.reload().await {
            warn!(fqdn, error = %e, "Web server reload after renewal failed");
        }
        info!(fqdn, "Certificate renewed");
        self.status(fqdn)
    }

    /// Revoke and delete the certificate, then drop the HTTPS vhost.
    pub async fn revoke(&self, fqdn: &str) -> Result<(), SslError> {
        validate_domain(fqdn)?;
        let spec = self
            .certbot("revoke")
            .args(["--cert-name", fqdn, "--delete-after-revoke"]);
        self.runner.run_checked(&spec).await?;
        let removed = self.vhosts.delete_ssl_site(fqdn).await?;
        debug!(fqdn, vhost_removed = removed, "HTTPS vhost removed");
        info!(fqdn, "Certificate revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::WebServerKind;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const EXAMPLE_COM: &str = include_str!("testdata/example.com.pem");
    const WILDCARD_EXAMPLE_ORG: &str = include_str!("testdata/wildcard.example.org.pem");

    fn manager() -> (TempDir, CommandRunner, SslManager) {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::simulated();
        let paths = HostPaths::rebased(dir.path());
        let vhosts = VhostDriver::from_kind(WebServerKind::Apache, runner.clone(), paths.clone());
        let ssl = SslManager::new(
            runner.clone(),
            paths,
            vhosts,
            Some("admin@panel.example".to_string()),
        );
        (dir, runner, ssl)
    }

    fn install(dir: &TempDir, fqdn: &str, pem: &str) {
        let live = dir.path().join("etc/letsencrypt/live").join(fqdn);
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("fullchain.pem"), pem).unwrap();
    }

    fn mid_2030() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_role_classification() {
        let main = FqdnRole::Main {
            owner: "alice".to_string(),
        };
        assert_eq!(FqdnRole::classify("alice.example", "alice.example", "alice"), Some(main.clone()));
        assert_eq!(FqdnRole::classify("www.alice.example", "alice.example", "alice"), Some(main));
        assert_eq!(
            FqdnRole::classify("webmail.alice.example", "alice.example", "alice"),
            Some(FqdnRole::System)
        );
        assert_eq!(FqdnRole::classify("shop.alice.example", "alice.example", "alice"), None);
        assert_eq!(FqdnRole::classify("xalice.example", "alice.example", "alice"), None);
    }

    #[test]
    fn test_status_own_certificate() {
        let (dir, _runner, ssl) = manager();
        install(&dir, "example.com", EXAMPLE_COM);
        let status = ssl.status_at("example.com", mid_2030()).unwrap();
        assert_eq!(status.status, SslStatus::Active);
        assert_eq!(status.covered_by, None);
        assert_eq!(status.issuer.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_status_covered_by_parent_san() {
        let (dir, _runner, ssl) = manager();
        install(&dir, "example.com", EXAMPLE_COM);

        let www = ssl.status_at("www.example.com", mid_2030()).unwrap();
        assert_eq!(www.status, SslStatus::Active);
        assert_eq!(www.covered_by.as_deref(), Some("example.com"));
        assert!(www.status_detail.unwrap().contains("example.com"));

        let mail = ssl.status_at("mail.example.com", mid_2030()).unwrap();
        assert_eq!(mail.status, SslStatus::None);
    }

    #[test]
    fn test_status_covered_by_parent_wildcard() {
        let (dir, _runner, ssl) = manager();
        install(&dir, "example.org", WILDCARD_EXAMPLE_ORG);
        let status = ssl.status_at("webmail.example.org", mid_2030()).unwrap();
        assert_eq!(status.status, SslStatus::Active);
        assert_eq!(status.covered_by.as_deref(), Some("example.org"));
    }

    #[test]
    fn test_expired_and_pending() {
        let (dir, _runner, ssl) = manager();
        install(&dir, "example.com", EXAMPLE_COM);
        let later = Utc.with_ymd_and_hms(2036, 1, 1, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(ssl.status_at("example.com", later).unwrap().status, SslStatus::Expired);
        assert_eq!(ssl.status_at("example.com", earlier).unwrap().status, SslStatus::Pending);
    }

    #[test]
    fn test_list_includes_standard_subdomains() {
        let (_dir, _runner, ssl) = manager();
        let list = ssl.list("alice.example", &["shop.alice.example".to_string()]).unwrap();
        let names: Vec<&str> = list.iter().map(|s| s.fqdn.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "alice.example",
                "www.alice.example",
                "mail.alice.example",
                "webmail.alice.example",
                "ftp.alice.example",
                "shop.alice.example",
            ]
        );
        assert!(list.iter().all(|s| s.status == SslStatus::None));
    }

    #[tokio::test]
    async fn test_issue_main_domain_requests_www() {
        let (dir, runner, ssl) = manager();
        let paths = HostPaths::rebased(dir.path());
        let role = FqdnRole::Main {
            owner: "alice".to_string(),
        };
        let vhost = VhostSpec::for_domain(&paths, "alice.example", "alice", "8.2");
        ssl.issue("alice.example", &role, &vhost).await.unwrap();

        let journal = runner.journal();
        assert_eq!(
            journal[0],
            "certbot certonly --non-interactive --agree-tos --keep-until-expiring --webroot -w /home/alice/public_html --cert-name alice.example -d alice.example -d www.alice.example -m admin@panel.example"
        );
        assert!(dir
            .path()
            .join("etc/apache2/sites-available/alice.example-ssl.conf")
            .exists());
    }

    #[tokio::test]
    async fn test_issue_system_subdomain_uses_shared_webroot() {
        let (dir, runner, ssl) = manager();
        let paths = HostPaths::rebased(dir.path());
        let vhost = VhostSpec::webmail(&paths, "alice.example", "alice", "8.2");
        ssl.issue("webmail.alice.example", &FqdnRole::System, &vhost)
            .await
            .unwrap();
        let first = &runner.journal()[0];
        assert!(first.contains("-w /var/www/html"));
        assert!(!first.contains("www.webmail"));
    }

    #[tokio::test]
    async fn test_revoke_removes_https_vhost() {
        let (dir, runner, ssl) = manager();
        let paths = HostPaths::rebased(dir.path());
        let role = FqdnRole::Main {
            owner: "alice".to_string(),
        };
        let vhost = VhostSpec::for_domain(&paths, "alice.example", "alice", "8.2");
        ssl.issue("alice.example", &role, &vhost).await.unwrap();
        ssl.revoke("alice.example").await.unwrap();

        assert!(!dir
            .path()
            .join("etc/apache2/sites-available/alice.example-ssl.conf")
            .exists());
        assert!(runner
            .journal()
            .contains(&"certbot revoke --non-interactive --cert-name alice.example --delete-after-revoke".to_string()));
    }
}
