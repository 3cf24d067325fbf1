use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::exec::{CommandRunner, CommandSpec, RunnerError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service not in whitelist: {0}")]
    NotWhitelisted(String),
    #[error(transparent)]
    Command(#[from] RunnerError),
}

/// Daemons the panel may control. PHP-FPM units are matched separately since
/// their names carry the installed version.
const MANAGED_SERVICES: &[&str] = &[
    "apache2", "nginx", "bind9", "named", "postfix", "dovecot", "opendkim", "mariadb", "mysql",
];

static PHP_FPM_UNIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^php[5-9]\.[0-9]-fpm$").unwrap());

/// Systemd unit name of the FPM master for a PHP version.
pub fn php_fpm_unit(version: &str) -> String {
    format!("php{}-fpm", version)
}

/// systemctl wrapper restricted to the managed daemons.
///
/// Every call goes through the [`CommandRunner`] with discrete arguments, so
/// simulate mode covers service control too.
#[derive(Debug, Clone)]
pub struct ServiceManager {
    runner: CommandRunner,
}

impl ServiceManager {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    pub fn is_managed(service: &str) -> bool {
        MANAGED_SERVICES.contains(&service) || PHP_FPM_UNIT_RE.is_match(service)
    }

    pub async fn start(&self, service: &str) -> Result<(), ServiceError> {
        self.run_systemctl("start", service).await?;
        info!(service, "Started service");
        Ok(())
    }

    pub async fn stop(&self, service: &str) -> Result<(), ServiceError> {
        self.run_systemctl("stop", service).await?;
        info!(service, "Stopped service");
        Ok(())
    }

    pub async fn restart(&self, service: &str) -> Result<(), ServiceError> {
        self.run_systemctl("restart", service).await?;
        info!(service, "Restarted service");
        Ok(())
    }

    pub async fn reload(&self, service: &str) -> Result<(), ServiceError> {
        self.run_systemctl("reload", service).await?;
        info!(service, "Reloaded service");
        Ok(())
    }

    /// Reload without failing the caller.
    ///
    /// The written config stays the source of truth and is picked up on the
    /// next successful reload, so a refused reload is only reported. Returns
    /// the failure text when there was one.
    pub async fn reload_lenient(&self, service: &str) -> Option<String> {
        match self.reload(service).await {
            Ok(()) => None,
            Err(e) => {
                warn!(service, error = %e, "Reload failed, continuing");
                Some(e.to_string())
            }
        }
    }

    /// Restart without failing the caller; see [`Self::reload_lenient`].
    pub async fn restart_lenient(&self, service: &str) -> Option<String> {
        match self.restart(service).await {
            Ok(()) => None,
            Err(e) => {
                warn!(service, error = %e, "Restart failed, continuing");
                Some(e.to_string())
            }
        }
    }

    pub async fn is_active(&self, service: &str) -> Result<bool, ServiceError> {
        Self::check_whitelist(service)?;
        let spec = CommandSpec::new("systemctl").args(["is-active", service]);
        let output = self.runner.run(&spec).await?;
        Ok(output.stdout.trim() == "active")
    }

    fn check_whitelist(service: &str) -> Result<(), ServiceError> {
        if !Self::is_managed(service) {
            return Err(ServiceError::NotWhitelisted(service.to_string()));
        }
        Ok(())
    }

    async fn run_systemctl(&self, action: &str, service: &str) -> Result<(), ServiceError> {
        Self::check_whitelist(service)?;
        let spec = CommandSpec::new("systemctl").args([action, service]);
        self.runner.run_checked(&spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist() {
        assert!(ServiceManager::is_managed("nginx"));
        assert!(ServiceManager::is_managed("php8.2-fpm"));
        assert!(!ServiceManager::is_managed("php8.2-fpm; reboot"));
        assert!(!ServiceManager::is_managed("sshd"));
    }

    #[tokio::test]
    async fn test_rejects_unmanaged_service() {
        let services = ServiceManager::new(CommandRunner::simulated());
        let err = services.restart("sshd").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotWhitelisted(_)));
    }

    #[tokio::test]
    async fn test_simulated_reload_is_journaled() {
        let runner = CommandRunner::simulated();
        let services = ServiceManager::new(runner.clone());
        assert!(services.reload_lenient("postfix").await.is_none());
        services.restart(&php_fpm_unit("8.2")).await.unwrap();
        assert_eq!(
            runner.journal(),
            vec!["systemctl reload postfix", "systemctl restart php8.2-fpm"]
        );
    }

    #[tokio::test]
    async fn test_lenient_reload_reports_failure() {
        let services = ServiceManager::new(CommandRunner::simulated());
        let failure = services.reload_lenient("not-a-daemon").await;
        assert!(failure.is_some_and(|msg| msg.contains("not-a-daemon")));
    }
}
