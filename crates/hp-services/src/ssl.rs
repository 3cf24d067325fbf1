//! Certificate listing and ACME operations, scoped to the caller's domains.

use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use hp_core::ssl::{CertificateStatus, FqdnRole, SslError};
use hp_core::web::VhostSpec;
use hp_db::models::{Domain, User};
use hp_db::{queries, Database, DbError};

use crate::context::{Actor, HostContext};
use crate::error::{db_kind, ErrorKind};

#[derive(Debug, Error)]
pub enum SslServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("Access denied")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Account is suspended: {0}")]
    Suspended(String),
    #[error(transparent)]
    Ssl(#[from] SslError),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl SslServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Ssl(SslError::Validation(_)) => ErrorKind::Validation,
            Self::Forbidden | Self::Suspended(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Ssl(_) => ErrorKind::Internal,
            Self::Database(e) => db_kind(e),
        }
    }
}

/// The account domain an FQDN belongs to, its owner, and how it is served.
struct Target {
    domain: Domain,
    owner: User,
    role: FqdnRole,
    vhost: VhostSpec,
}

impl Target {
    fn is_main(&self, fqdn: &str) -> bool {
        fqdn == self.domain.name
    }
}

/// `fqdn` and each parent name, longest first.
fn candidate_domains(fqdn: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(fqdn), |name| name.split_once('.').map(|(_, rest)| rest))
        .filter(|name| name.contains('.'))
}

#[derive(Clone)]
pub struct SslService {
    db: Database,
    host: HostContext,
}

impl SslService {
    pub fn new(db: Database, host: HostContext) -> Self {
        Self { db, host }
    }

    async fn visible_domains(&self, actor: &Actor) -> Result<Vec<Domain>, DbError> {
        let pool = self.db.pool();
        if actor.is_admin() {
            return queries::all_domains(pool).await;
        }
        let mut domains = queries::domains_for_user(pool, actor.id).await?;
        if actor.role == hp_db::models::Role::Reseller {
            for client in queries::list_users_by_parent(pool, actor.id).await? {
                domains.extend(queries::domains_for_user(pool, client.id).await?);
            }
        }
        Ok(domains)
    }

    /// Certificate status for every name of every domain the caller can see.
    pub async fn list(&self, actor: &Actor) -> Result<Vec<CertificateStatus>, SslServiceError> {
        let mut out = Vec::new();
        for domain in self.visible_domains(actor).await? {
            let extra: Vec<String> = queries::subdomains_for_domain(self.db.pool(), domain.id)
                .await?
                .into_iter()
                .map(|s| format!("{}.{}", s.name, domain.name))
                .collect();
            out.extend(self.host.ssl.list(&domain.name, &extra)?);
        }
        Ok(out)
    }

    async fn resolve(&self, actor: &Actor, fqdn: &str) -> Result<Target, SslServiceError> {
        let pool = self.db.pool();
        let fqdn_owned = fqdn.to_ascii_lowercase();
        let fqdn = fqdn_owned.as_str();

        let mut found = None;
        for name in candidate_domains(fqdn) {
            if let Some(domain) = queries::find_domain_by_name(pool, name).await? {
                found = Some(domain);
                break;
            }
        }
        let domain = match found {
            Some(domain) => domain,
            None if actor.is_admin() => return Err(SslServiceError::NotFound(fqdn.to_string())),
            None => return Err(SslServiceError::Forbidden),
        };
        let owner = queries::get_user(pool, domain.user_id).await?;
        if !actor.can_manage(&owner) {
            return Err(SslServiceError::Forbidden);
        }

        let paths = &self.host.paths;
        let default_php = &self.host.settings.php_default_version;
        if let Some(role) = FqdnRole::classify(fqdn, &domain.name, &owner.username) {
            let vhost = match &role {
                FqdnRole::Main { .. } if fqdn != domain.name => {
                    return Err(SslServiceError::Validation(format!(
                        "{} is covered by the certificate for {}",
                        fqdn, domain.name
                    )));
                }
                FqdnRole::Main { .. } => {
                    VhostSpec::for_domain(paths, &domain.name, &owner.username, &domain.php_version)
                }
                _ if fqdn.starts_with("webmail.") => {
                    VhostSpec::webmail(paths, &domain.name, &owner.username, default_php)
                }
                _ => VhostSpec::system(paths, fqdn, &owner.username, default_php),
            };
            return Ok(Target {
                domain,
                owner,
                role,
                vhost,
            });
        }

        let label = fqdn
            .strip_suffix(domain.name.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
            .unwrap_or_default();
        let subdomain = queries::subdomains_for_domain(pool, domain.id)
            .await?
            .into_iter()
            .find(|s| s.name == label)
            .ok_or_else(|| SslServiceError::NotFound(fqdn.to_string()))?;

        let document_root = PathBuf::from(&subdomain.document_root);
        let vhost = match subdomain.proxy_port {
            Some(port) => {
                let port = u16::try_from(port)
                    .map_err(|_| SslServiceError::Validation(format!("invalid proxy port {}", port)))?;
                VhostSpec::for_proxy(paths, fqdn, &owner.username, port)
            }
            None => VhostSpec::for_subdomain(
                paths,
                fqdn,
                &owner.username,
                subdomain.php_version.as_deref().unwrap_or(&domain.php_version),
                document_root.clone(),
            ),
        };
        Ok(Target {
            domain,
            owner,
            role: FqdnRole::Subdomain { document_root },
            vhost,
        })
    }

    fn ensure_owner_active(target: &Target) -> Result<(), SslServiceError> {
        if target.owner.is_active {
            Ok(())
        } else {
            Err(SslServiceError::Suspended(target.owner.username.clone()))
        }
    }

    pub async fn issue(&self, actor: &Actor, fqdn: &str) -> Result<CertificateStatus, SslServiceError> {
        let fqdn = fqdn.to_ascii_lowercase();
        let target = self.resolve(actor, &fqdn).await?;
        Self::ensure_owner_active(&target)?;

        let status = self.host.ssl.issue(&fqdn, &target.role, &target.vhost).await?;
        let pool = self.db.pool();
        if target.is_main(&fqdn) {
            queries::set_domain_ssl(pool, target.domain.id, true).await?;
        }
        queries::log_activity(pool, Some(actor.id), "ssl.issue", &fqdn, None).await?;
        info!(fqdn = %fqdn, owner = %target.owner.username, "Certificate issued for account");
        Ok(status)
    }

    pub async fn renew(&self, actor: &Actor, fqdn: &str) -> Result<CertificateStatus, SslServiceError> {
        let fqdn = fqdn.to_ascii_lowercase();
        let target = self.resolve(actor, &fqdn).await?;
        Self::ensure_owner_active(&target)?;

        let status = self.host.ssl.renew(&fqdn).await?;
        queries::log_activity(self.db.pool(), Some(actor.id), "ssl.renew", &fqdn, None).await?;
        Ok(status)
    }

    pub async fn revoke(&self, actor: &Actor, fqdn: &str) -> Result<(), SslServiceError> {
        let fqdn = fqdn.to_ascii_lowercase();
        let target = self.resolve(actor, &fqdn).await?;

        self.host.ssl.revoke(&fqdn).await?;
        let pool = self.db.pool();
        if target.is_main(&fqdn) {
            queries::set_domain_ssl(pool, target.domain.id, false).await?;
        }
        queries::log_activity(pool, Some(actor.id), "ssl.revoke", &fqdn, None).await?;
        info!(fqdn = %fqdn, owner = %target.owner.username, "Certificate revoked for account");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HostSettings;
    use hp_core::exec::CommandRunner;
    use hp_core::fs::HostPaths;
    use hp_core::ssl::SslStatus;
    use hp_core::web::WebServerKind;
    use hp_db::models::{NewDomain, NewUser, Role};
    use std::fs;
    use tempfile::TempDir;

    const EXAMPLE_COM: &str = include_str!("../../hp-core/src/ssl/testdata/example.com.pem");

    struct Fixture {
        dir: TempDir,
        db: Database,
        runner: CommandRunner,
        service: SslService,
        owner: Actor,
        domain_id: i64,
    }

    async fn fixture(domain: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("panel.db")).await.unwrap();
        db.migrate().await.unwrap();
        let owner_id = queries::create_user(
            db.pool(),
            &NewUser {
                username: "alice",
                email: "alice@example.net",
                password_hash: "x",
                role: Role::User,
                parent_id: None,
            },
        )
        .await
        .unwrap();
        let domain_id = queries::create_domain(
            db.pool(),
            &NewDomain {
                user_id: owner_id,
                name: domain,
                document_root: "/home/alice/public_html",
                php_version: "8.2",
            },
        )
        .await
        .unwrap();

        let runner = CommandRunner::simulated();
        let host = HostContext::new(
            runner.clone(),
            HostPaths::rebased(dir.path().join("root")),
            HostSettings {
                web_server: WebServerKind::Apache,
                php_default_version: "8.2".to_string(),
                server_ip: "203.0.113.10".to_string(),
                nameservers: vec!["ns1.panel.example".to_string(), "ns2.panel.example".to_string()],
                acme_email: Some("admin@panel.example".to_string()),
            },
        );
        Fixture {
            service: SslService::new(db.clone(), host),
            dir,
            db,
            runner,
            owner: Actor::new(owner_id, "alice", Role::User),
            domain_id,
        }
    }

    #[test]
    fn test_candidate_domains_walk_up_to_registrable_name() {
        let names: Vec<&str> = candidate_domains("shop.alice.example").collect();
        assert_eq!(names, vec!["shop.alice.example", "alice.example"]);
    }

    #[tokio::test]
    async fn test_issue_main_domain_installs_https_vhost() {
        let f = fixture("alice.example").await;
        f.service.issue(&f.owner, "alice.example").await.unwrap();

        let journal = f.runner.journal();
        let certbot = journal
            .iter()
            .find(|line| line.starts_with("certbot certonly"))
            .expect("certbot was not invoked");
        assert!(certbot.contains("-d alice.example -d www.alice.example"));
        assert!(f.service.host.vhosts.site_exists("alice.example-ssl"));
        let domain = queries::get_domain(f.db.pool(), f.domain_id).await.unwrap();
        assert!(domain.ssl_enabled);

        f.service.revoke(&f.owner, "alice.example").await.unwrap();
        assert!(!f.service.host.vhosts.site_exists("alice.example-ssl"));
        let domain = queries::get_domain(f.db.pool(), f.domain_id).await.unwrap();
        assert!(!domain.ssl_enabled);
    }

    #[tokio::test]
    async fn test_www_is_not_issued_separately() {
        let f = fixture("alice.example").await;
        let err = f.service.issue(&f.owner, "www.alice.example").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_list_reports_parent_coverage() {
        let f = fixture("example.com").await;
        let live = f.dir.path().join("root/etc/letsencrypt/live/example.com");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("fullchain.pem"), EXAMPLE_COM).unwrap();

        let statuses = f.service.list(&f.owner).await.unwrap();
        let www = statuses.iter().find(|s| s.fqdn == "www.example.com").unwrap();
        assert_eq!(www.status, SslStatus::Active);
        assert_eq!(www.covered_by.as_deref(), Some("example.com"));
        let mail = statuses.iter().find(|s| s.fqdn == "mail.example.com").unwrap();
        assert_eq!(mail.status, SslStatus::None);
    }

    #[tokio::test]
    async fn test_other_tenants_cannot_touch_certificates() {
        let f = fixture("alice.example").await;
        let mallory = Actor::new(f.owner.id + 100, "mallory", Role::User);
        for fqdn in ["alice.example", "nobody.example"] {
            let err = f.service.issue(&mallory, fqdn).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Forbidden);
        }
        assert!(f.service.list(&mallory).await.unwrap().is_empty());
        assert!(f.runner.journal().is_empty());
    }
}
