//! Web-server virtual hosts.
//!
//! [`VhostDriver`] is a closed sum over the supported servers, chosen once from
//! configuration. Both variants share the file layout
//! `/etc/<server>/sites-available/<site>.conf`, where `<site>` is the server
//! name for the plain-HTTP vhost and `<server name>-ssl` for the HTTPS one.

pub mod apache;
pub mod nginx;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::fs::atomic::{atomic_write_config, remove_if_exists, AtomicWriteError};
use crate::fs::HostPaths;
use crate::service::ServiceManager;

pub use apache::ApacheDriver;
pub use nginx::NginxDriver;

/// Document root of the Roundcube installation served on `webmail.<domain>`.
pub const WEBMAIL_DOCUMENT_ROOT: &str = "/var/lib/roundcube/public_html";

/// Shared webroot for ACME challenges of system subdomains.
pub const SYSTEM_WEBROOT: &str = "/var/www/html";

pub const ACME_CHALLENGE_PATH: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Error)]
pub enum VhostError {
    #[error("Failed to write vhost: {0}")]
    Write(#[from] AtomicWriteError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] RunnerError),
    #[error("{server} configuration test failed: {output}")]
    ConfigTest { server: String, output: String },
    #[error("Unknown web server: {0}")]
    UnknownServer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebServerKind {
    Apache,
    Nginx,
}

impl fmt::Display for WebServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apache => write!(f, "apache"),
            Self::Nginx => write!(f, "nginx"),
        }
    }
}

impl FromStr for WebServerKind {
    type Err = VhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apache" | "apache2" => Ok(Self::Apache),
            "nginx" => Ok(Self::Nginx),
            other => Err(VhostError::UnknownServer(other.to_string())),
        }
    }
}

/// How requests that are not static files get served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VhostHandler {
    /// `.php` requests go to an FPM Unix socket.
    Php { socket: String },
    /// Everything is proxied to a local application port, WebSockets included.
    Proxy { port: u16 },
}

/// Per-user FPM socket, `/run/php/php<ver>-fpm-<user>.sock`.
pub fn user_fpm_socket(php_version: &str, username: &str) -> String {
    format!("/run/php/php{}-fpm-{}.sock", php_version, username)
}

/// Socket of the distribution's default `www` pool.
pub fn system_fpm_socket(php_version: &str) -> String {
    format!("/run/php/php{}-fpm.sock", php_version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub certificate: String,
    pub key: String,
}

impl TlsPaths {
    /// Certificate and key in the ACME client's live tree.
    pub fn letsencrypt(fqdn: &str) -> Self {
        Self {
            certificate: format!("/etc/letsencrypt/live/{}/fullchain.pem", fqdn),
            key: format!("/etc/letsencrypt/live/{}/privkey.pem", fqdn),
        }
    }
}

/// A URL prefix served from a directory outside the document root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAlias {
    pub url_path: String,
    pub directory: String,
}

impl PathAlias {
    pub fn acme_challenge() -> Self {
        Self {
            url_path: ACME_CHALLENGE_PATH.to_string(),
            directory: format!("{}{}", SYSTEM_WEBROOT, ACME_CHALLENGE_PATH),
        }
    }
}

/// Everything needed to render one vhost. Paths are logical.
#[derive(Debug, Clone, PartialEq)]
pub struct VhostSpec {
    pub server_name: String,
    pub aliases: Vec<String>,
    pub document_root: PathBuf,
    /// Access and error logs land here, normally `<home>/logs`.
    pub log_dir: PathBuf,
    pub admin_email: String,
    pub handler: VhostHandler,
    pub path_aliases: Vec<PathAlias>,
    /// Present for the HTTPS variant.
    pub tls: Option<TlsPaths>,
}

impl VhostSpec {
    /// Main-domain vhost: `<domain>` plus `www.<domain>`, served from the
    /// owner's `public_html` through their FPM pool.
    pub fn for_domain(paths: &HostPaths, domain: &str, username: &str, php_version: &str) -> Self {
        Self {
            server_name: domain.to_string(),
            aliases: vec![format!("www.{}", domain)],
            document_root: paths.public_html(username),
            log_dir: paths.logs_dir(username),
            admin_email: format!("webmaster@{}", domain),
            handler: VhostHandler::Php {
                socket: user_fpm_socket(php_version, username),
            },
            path_aliases: Vec::new(),
            tls: None,
        }
    }

    /// Subdomain proxied to an application listening on `port`.
    pub fn for_proxy(paths: &HostPaths, fqdn: &str, username: &str, port: u16) -> Self {
        Self {
            server_name: fqdn.to_string(),
            aliases: Vec::new(),
            document_root: paths.public_html(username),
            log_dir: paths.logs_dir(username),
            admin_email: format!("webmaster@{}", fqdn),
            handler: VhostHandler::Proxy { port },
            path_aliases: Vec::new(),
            tls: None,
        }
    }

    /// `webmail.<domain>`: Roundcube through the system FPM pool, with ACME
    /// challenges answered from the shared webroot.
    pub fn webmail(paths: &HostPaths, domain: &str, username: &str, php_version: &str) -> Self {
        Self {
            server_name: format!("webmail.{}", domain),
            aliases: Vec::new(),
            document_root: PathBuf::from(WEBMAIL_DOCUMENT_ROOT),
            log_dir: paths.logs_dir(username),
            admin_email: format!("postmaster@{}", domain),
            handler: VhostHandler::Php {
                socket: system_fpm_socket(php_version),
            },
            path_aliases: vec![PathAlias::acme_challenge()],
            tls: None,
        }
    }

    /// User subdomain served from its own document root through the owner's pool.
    pub fn for_subdomain(
        paths: &HostPaths,
        fqdn: &str,
        username: &str,
        php_version: &str,
        document_root: PathBuf,
    ) -> Self {
        Self {
            server_name: fqdn.to_string(),
            aliases: Vec::new(),
            document_root,
            ..Self::for_domain(paths, fqdn, username, php_version)
        }
    }

    /// `mail.` and `ftp.` names: a static site on the shared webroot that
    /// only exists so the name can hold a certificate.
    pub fn system(paths: &HostPaths, fqdn: &str, username: &str, php_version: &str) -> Self {
        Self {
            server_name: fqdn.to_string(),
            aliases: Vec::new(),
            document_root: PathBuf::from(SYSTEM_WEBROOT),
            log_dir: paths.logs_dir(username),
            admin_email: format!("webmaster@{}", fqdn),
            handler: VhostHandler::Php {
                socket: system_fpm_socket(php_version),
            },
            path_aliases: Vec::new(),
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsPaths) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Site name used for file names and enable/disable.
    pub fn site_name(&self) -> String {
        match self.tls {
            Some(_) => ssl_site_name(&self.server_name),
            None => self.server_name.clone(),
        }
    }

    /// Log file prefix; the HTTPS vhost logs next to the plain one.
    pub(crate) fn log_path(&self, kind: &str) -> String {
        self.log_dir
            .join(format!("{}-{}.log", self.server_name, kind))
            .display()
            .to_string()
    }
}

pub fn ssl_site_name(server_name: &str) -> String {
    format!("{}-ssl", server_name)
}

/// Rendered configuration ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedVhost {
    pub site: String,
    pub content: String,
}

/// The supported web servers behind one capability set.
#[derive(Debug, Clone)]
pub enum VhostDriver {
    Apache(ApacheDriver),
    Nginx(NginxDriver),
}

impl VhostDriver {
    pub fn from_kind(kind: WebServerKind, runner: CommandRunner, paths: HostPaths) -> Self {
        match kind {
            WebServerKind::Apache => Self::Apache(ApacheDriver::new(runner, paths)),
            WebServerKind::Nginx => Self::Nginx(NginxDriver::new(runner, paths)),
        }
    }

    pub fn kind(&self) -> WebServerKind {
        match self {
            Self::Apache(_) => WebServerKind::Apache,
            Self::Nginx(_) => WebServerKind::Nginx,
        }
    }

    fn tree(&self) -> &SiteTree {
        match self {
            Self::Apache(d) => &d.tree,
            Self::Nginx(d) => &d.tree,
        }
    }

    pub fn supports_htaccess(&self) -> bool {
        matches!(self, Self::Apache(_))
    }

    /// Deterministic: identical specs render byte-identical content.
    pub fn render(&self, spec: &VhostSpec) -> RenderedVhost {
        let content = match self {
            Self::Apache(_) => apache::render(spec),
            Self::Nginx(_) => nginx::render(spec),
        };
        RenderedVhost {
            site: spec.site_name(),
            content,
        }
    }

    /// Logical path of `sites-available/<site>.conf`.
    pub fn available_path(&self, site: &str) -> PathBuf {
        self.tree().available(site)
    }

    pub fn site_exists(&self, site: &str) -> bool {
        self.tree().resolve(&self.available_path(site)).exists()
    }

    pub fn write(&self, rendered: &RenderedVhost) -> Result<PathBuf, VhostError> {
        let logical = self.available_path(&rendered.site);
        atomic_write_config(&self.tree().resolve(&logical), &rendered.content)?;
        debug!(site = %rendered.site, path = %logical.display(), "Wrote vhost");
        Ok(logical)
    }

    pub async fn enable(&self, site: &str) -> Result<(), VhostError> {
        match self {
            Self::Apache(d) => d.enable(site).await,
            Self::Nginx(d) => d.enable(site),
        }
    }

    pub async fn disable(&self, site: &str) -> Result<(), VhostError> {
        match self {
            Self::Apache(d) => d.disable(site).await,
            Self::Nginx(d) => d.disable(site),
        }
    }

    /// Disable and remove one site file. Returns whether a file was removed.
    pub async fn delete(&self, site: &str) -> Result<bool, VhostError> {
        self.disable(site).await?;
        let removed = remove_if_exists(&self.tree().resolve(&self.available_path(site)))?;
        if removed {
            info!(site, "Deleted vhost");
        }
        Ok(removed)
    }

    /// Run the server's own syntax check. Failure carries its output.
    pub async fn test(&self) -> Result<(), VhostError> {
        let spec = match self {
            Self::Apache(_) => CommandSpec::new("apache2ctl").arg("configtest"),
            Self::Nginx(_) => CommandSpec::new("nginx").arg("-t"),
        };
        let output = self.tree().runner.run(&spec).await?;
        if !output.success() {
            return Err(VhostError::ConfigTest {
                server: self.kind().to_string(),
                output: output.combined(),
            });
        }
        Ok(())
    }

    /// Test, then reload. A failed test aborts before the daemon is touched;
    /// a refused reload after a passing test is only logged.
    pub async fn reload(&self) -> Result<(), VhostError> {
        self.test().await?;
        let tree = self.tree();
        tree.services.reload_lenient(tree.service).await;
        Ok(())
    }

    /// Whether `sites-enabled/<site>.conf` is present.
    pub fn is_enabled(&self, site: &str) -> bool {
        std::fs::symlink_metadata(self.tree().resolve(&self.tree().enabled(site))).is_ok()
    }

    /// Render, write, enable and reload. Re-running with the same spec leaves
    /// the same single file behind. If enabling or the config test fails, the
    /// site is put back the way it was so other sites keep reloading.
    pub async fn create(&self, spec: &VhostSpec) -> Result<PathBuf, VhostError> {
        let rendered = self.render(spec);
        let on_disk = self.tree().resolve(&self.available_path(&rendered.site));
        let previous = match std::fs::read_to_string(&on_disk) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let was_enabled = self.is_enabled(&rendered.site);

        let path = self.write(&rendered)?;
        let applied = match self.enable(&rendered.site).await {
            Ok(()) => self.reload().await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            warn!(site = %rendered.site, error = %e, "Vhost rejected, restoring previous state");
            self.restore(&rendered.site, previous, was_enabled).await;
            return Err(e);
        }
        info!(site = %rendered.site, server = %self.kind(), "Vhost created");
        Ok(path)
    }

    async fn restore(&self, site: &str, previous: Option<String>, was_enabled: bool) {
        if !was_enabled {
            if let Err(e) = self.disable(site).await {
                warn!(site, error = %e, "Failed to disable rejected vhost");
            }
        }
        let on_disk = self.tree().resolve(&self.available_path(site));
        let restored = match previous {
            Some(old) => atomic_write_config(&on_disk, &old).map_err(VhostError::from),
            None => remove_if_exists(&on_disk).map(|_| ()).map_err(VhostError::from),
        };
        if let Err(e) = restored {
            warn!(site, error = %e, "Failed to restore vhost file");
        }
    }

    /// HTTPS variant of `spec` using the given certificate paths.
    pub async fn create_ssl(&self, spec: &VhostSpec, tls: TlsPaths) -> Result<PathBuf, VhostError> {
        self.create(&spec.clone().with_tls(tls)).await
    }

    /// Remove both variants of a site and reload.
    pub async fn delete_site(&self, server_name: &str) -> Result<(), VhostError> {
        self.delete(server_name).await?;
        self.delete(&ssl_site_name(server_name)).await?;
        self.reload().await
    }

    /// Remove only the HTTPS variant and reload.
    pub async fn delete_ssl_site(&self, server_name: &str) -> Result<bool, VhostError> {
        let removed = self.delete(&ssl_site_name(server_name)).await?;
        self.reload().await?;
        Ok(removed)
    }
}

/// Directory layout and collaborators common to both drivers.
#[derive(Debug, Clone)]
pub(crate) struct SiteTree {
    pub(crate) runner: CommandRunner,
    pub(crate) paths: HostPaths,
    pub(crate) services: ServiceManager,
    /// `/etc/apache2` or `/etc/nginx`.
    pub(crate) config_root: PathBuf,
    /// systemd unit reloaded after changes.
    pub(crate) service: &'static str,
}

impl SiteTree {
    pub(crate) fn new(
        runner: CommandRunner,
        paths: HostPaths,
        config_root: &str,
        service: &'static str,
    ) -> Self {
        Self {
            services: ServiceManager::new(runner.clone()),
            runner,
            paths,
            config_root: PathBuf::from(config_root),
            service,
        }
    }

    pub(crate) fn available(&self, site: &str) -> PathBuf {
        self.config_root
            .join("sites-available")
            .join(format!("{}.conf", site))
    }

    pub(crate) fn enabled(&self, site: &str) -> PathBuf {
        self.config_root
            .join("sites-enabled")
            .join(format!("{}.conf", site))
    }

    pub(crate) fn resolve(&self, logical: &Path) -> PathBuf {
        self.paths.resolve(logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample_spec() -> VhostSpec {
        VhostSpec::for_domain(&HostPaths::system(), "alice.example", "alice", "8.2")
    }

    fn driver(kind: WebServerKind) -> (TempDir, CommandRunner, VhostDriver) {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::simulated();
        let driver = VhostDriver::from_kind(kind, runner.clone(), HostPaths::rebased(dir.path()));
        (dir, runner, driver)
    }

    #[test]
    fn test_web_server_kind_parsing() {
        assert_eq!("apache".parse::<WebServerKind>().unwrap(), WebServerKind::Apache);
        assert_eq!("nginx".parse::<WebServerKind>().unwrap(), WebServerKind::Nginx);
        assert!("lighttpd".parse::<WebServerKind>().is_err());
    }

    #[test]
    fn test_socket_paths() {
        assert_eq!(user_fpm_socket("8.2", "alice"), "/run/php/php8.2-fpm-alice.sock");
        assert_eq!(system_fpm_socket("8.1"), "/run/php/php8.1-fpm.sock");
    }

    #[test]
    fn test_render_is_deterministic() {
        for kind in [WebServerKind::Apache, WebServerKind::Nginx] {
            let (_dir, _runner, driver) = driver(kind);
            assert_eq!(driver.render(&sample_spec()), driver.render(&sample_spec()));
        }
    }

    #[test]
    fn test_htaccess_support() {
        assert!(driver(WebServerKind::Apache).2.supports_htaccess());
        assert!(!driver(WebServerKind::Nginx).2.supports_htaccess());
    }

    #[test]
    fn test_site_names() {
        let spec = sample_spec();
        assert_eq!(spec.site_name(), "alice.example");
        let ssl = spec.with_tls(TlsPaths::letsencrypt("alice.example"));
        assert_eq!(ssl.site_name(), "alice.example-ssl");
    }

    #[tokio::test]
    async fn test_apache_create_and_delete_site() {
        let (dir, runner, driver) = driver(WebServerKind::Apache);
        let spec = sample_spec();

        driver.create(&spec).await.unwrap();
        driver.create(&spec).await.unwrap();
        let file = dir.path().join("etc/apache2/sites-available/alice.example.conf");
        assert!(file.exists());
        assert!(driver.site_exists("alice.example"));

        driver
            .create_ssl(&spec, TlsPaths::letsencrypt("alice.example"))
            .await
            .unwrap();
        assert!(driver.site_exists("alice.example-ssl"));

        driver.delete_site("alice.example").await.unwrap();
        assert!(!file.exists());
        assert!(!driver.site_exists("alice.example-ssl"));

        let journal = runner.journal();
        assert_eq!(
            &journal[..3],
            &[
                "a2ensite alice.example",
                "apache2ctl configtest",
                "systemctl reload apache2",
            ]
        );
        assert!(journal.contains(&"a2dissite alice.example-ssl".to_string()));
    }

    #[tokio::test]
    async fn test_nginx_enable_uses_relative_symlink() {
        let (dir, runner, driver) = driver(WebServerKind::Nginx);
        driver.create(&sample_spec()).await.unwrap();

        let link = dir.path().join("etc/nginx/sites-enabled/alice.example.conf");
        let target = std::fs::read_link(&link).unwrap();
        assert_eq!(target, PathBuf::from("../sites-available/alice.example.conf"));
        assert!(link.exists());
        assert_eq!(runner.journal(), vec!["nginx -t", "systemctl reload nginx"]);

        driver.delete_site("alice.example").await.unwrap();
        assert!(std::fs::symlink_metadata(&link).is_err());
    }

    #[tokio::test]
    async fn test_rejected_new_site_leaves_nothing_enabled() {
        for (kind, test_cmd, root) in [
            (WebServerKind::Apache, "apache2ctl configtest", "etc/apache2"),
            (WebServerKind::Nginx, "nginx -t", "etc/nginx"),
        ] {
            let (dir, runner, driver) = driver(kind);
            runner.fail_commands_starting_with(test_cmd);

            let err = driver.create(&sample_spec()).await.unwrap_err();
            assert!(matches!(err, VhostError::ConfigTest { .. }));

            let available = dir.path().join(root).join("sites-available/alice.example.conf");
            let enabled = dir.path().join(root).join("sites-enabled/alice.example.conf");
            assert!(!available.exists(), "{kind} left the site file");
            assert!(std::fs::symlink_metadata(&enabled).is_err(), "{kind} left the site enabled");
            assert!(!runner.journal().iter().any(|c| c.starts_with("systemctl reload")));
        }
        let (_dir, runner, driver) = driver(WebServerKind::Apache);
        runner.fail_commands_starting_with("apache2ctl configtest");
        driver.create(&sample_spec()).await.unwrap_err();
        assert!(runner.journal().contains(&"a2dissite alice.example".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_update_restores_previous_site() {
        let (dir, runner, driver) = driver(WebServerKind::Nginx);
        driver.create(&sample_spec()).await.unwrap();
        let available = dir.path().join("etc/nginx/sites-available/alice.example.conf");
        let before = std::fs::read_to_string(&available).unwrap();

        runner.fail_commands_starting_with("nginx -t");
        let changed = VhostSpec::for_proxy(&HostPaths::system(), "alice.example", "alice", 3000);
        driver.create(&changed).await.unwrap_err();

        assert_eq!(std::fs::read_to_string(&available).unwrap(), before);
        assert!(driver.is_enabled("alice.example"));
    }

    #[tokio::test]
    async fn test_delete_missing_site_is_fine() {
        let (_dir, _runner, driver) = driver(WebServerKind::Nginx);
        assert!(!driver.delete("nothing.example").await.unwrap());
    }
}
