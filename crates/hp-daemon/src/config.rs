use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use hp_core::exec::CommandRunner;
use hp_core::fs::HostPaths;
use hp_core::security::credentials::generate_secret;
use hp_core::web::WebServerKind;
use hp_services::HostSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostpanel/hostpanel.toml";

const GENERATED_SECRET_LEN: usize = 64;

/// Command-line flags. Every setting is optional here so that only flags
/// actually given override the lower layers.
#[derive(Parser, Serialize, Debug, Default)]
#[command(name = "hostpanel", version, about = "Hosting control panel daemon")]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    #[serde(skip)]
    pub config: PathBuf,

    /// Print a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_server: Option<WebServerKind>,

    /// Run without touching the host: commands are journaled, files land
    /// under `simulate_base`
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulate: Option<bool>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulate_base: Option<PathBuf>,

    /// Structured JSON logs
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_logs: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub jwt_secret: String,
    pub bind_address: String,
    pub port: u16,
    pub php_default_version: String,
    pub web_server: WebServerKind,
    pub home_base: PathBuf,
    pub server_ip: String,
    pub nameservers: Vec<String>,
    pub zones_dir: PathBuf,
    pub acme_email: Option<String>,
    pub simulate: bool,
    pub simulate_base: PathBuf,
    pub json_logs: bool,
    pub command_timeout_secs: u64,
    pub mail_worker_tick_secs: u64,
    pub mail_worker_batch: i64,
    pub mail_worker_lease_secs: u64,
    pub token_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/hostpanel/panel.db"),
            jwt_secret: String::new(),
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            php_default_version: "8.2".to_string(),
            web_server: WebServerKind::Apache,
            home_base: PathBuf::from("/home"),
            server_ip: "127.0.0.1".to_string(),
            nameservers: vec!["ns1.localhost".to_string(), "ns2.localhost".to_string()],
            zones_dir: PathBuf::from("/etc/bind/zones"),
            acme_email: None,
            simulate: false,
            simulate_base: PathBuf::from("/tmp/hostpanel-simulate"),
            json_logs: false,
            command_timeout_secs: 300,
            mail_worker_tick_secs: 60,
            mail_worker_batch: 50,
            mail_worker_lease_secs: 900,
            token_ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
    #[error("jwt_secret must be set unless simulate is on")]
    MissingJwtSecret,
    #[error("nameservers must list exactly two hostnames, got {0}")]
    Nameservers(usize),
    #[error("Invalid bind address {0}")]
    BindAddress(String),
}

impl Config {
    /// Layered load: built-in defaults < TOML file < `HOSTPANEL_*` env < CLI.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::figment(cli)
            .extract()
            .map_err(|e| ConfigError::Figment(Box::new(e)))
    }

    pub fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("HOSTPANEL_"))
            .merge(Serialized::defaults(cli))
    }

    /// Checks that need more than types. Fills in a throwaway JWT secret in
    /// simulate mode.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if self.nameservers.len() != 2 {
            return Err(ConfigError::Nameservers(self.nameservers.len()));
        }
        self.bind_addr()?;
        if self.jwt_secret.is_empty() {
            if !self.simulate {
                return Err(ConfigError::MissingJwtSecret);
            }
            warn!("jwt_secret is empty; using a random secret, tokens will not survive a restart");
            self.jwt_secret = generate_secret(GENERATED_SECRET_LEN);
        }
        Ok(self)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|_| ConfigError::BindAddress(format!("{}:{}", self.bind_address, self.port)))
    }

    pub fn runner(&self) -> CommandRunner {
        if self.simulate {
            CommandRunner::simulated()
        } else {
            CommandRunner::new(Duration::from_secs(self.command_timeout_secs))
        }
    }

    pub fn host_paths(&self) -> HostPaths {
        let paths = if self.simulate {
            HostPaths::rebased(&self.simulate_base)
        } else {
            HostPaths::system()
        };
        paths
            .with_home_base(&self.home_base)
            .with_zones_dir(&self.zones_dir)
    }

    pub fn host_settings(&self) -> HostSettings {
        HostSettings {
            web_server: self.web_server,
            php_default_version: self.php_default_version.clone(),
            server_ip: self.server_ip.clone(),
            nameservers: self.nameservers.clone(),
            acme_email: self.acme_email.clone(),
        }
    }
}

/// Commented TOML template for `--generate-config`.
pub fn generate_config_template() -> String {
    r#"# hostpanel configuration
# Default location: /etc/hostpanel/hostpanel.toml (override with --config <path>)
# Every key can also be set through HOSTPANEL_<KEY> environment variables.

# SQLite metadata store
# database_path = "/var/lib/hostpanel/panel.db"

# HS256 signing secret for API tokens. Required unless simulate = true.
# jwt_secret = ""

# token_ttl_secs = 86400

# bind_address = "127.0.0.1"
# port = 8080

# "apache" or "nginx"
# web_server = "apache"

# php_default_version = "8.2"
# home_base = "/home"

# Used for A records and SPF in new zones
# server_ip = "127.0.0.1"
# nameservers = ["ns1.localhost", "ns2.localhost"]
# zones_dir = "/etc/bind/zones"

# Contact address given to the ACME client
# acme_email = "admin@example.com"

# Journal commands instead of running them; files go under simulate_base
# simulate = false
# simulate_base = "/tmp/hostpanel-simulate"

# json_logs = false
# command_timeout_secs = 300

# Mail queue worker
# mail_worker_tick_secs = 60
# mail_worker_batch = 50
# mail_worker_lease_secs = 900
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_override_in_order() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "panel.toml",
                r#"
                port = 9000
                web_server = "nginx"
                server_ip = "203.0.113.10"
                "#,
            )?;
            jail.set_env("HOSTPANEL_PORT", "9100");
            let cli = Cli {
                config: PathBuf::from("panel.toml"),
                simulate: Some(true),
                ..Default::default()
            };
            let config = Config::load(&cli).map_err(|e| e.to_string())?;
            assert_eq!(config.port, 9100);
            assert_eq!(config.web_server, WebServerKind::Nginx);
            assert_eq!(config.server_ip, "203.0.113.10");
            assert!(config.simulate);
            assert_eq!(config.php_default_version, "8.2");
            Ok(())
        });
    }

    #[test]
    fn test_empty_secret_rules() {
        let err = Config::default().finalize().unwrap_err();
        assert!(matches!(err, ConfigError::MissingJwtSecret));

        let config = Config {
            simulate: true,
            ..Default::default()
        }
        .finalize()
        .unwrap();
        assert_eq!(config.jwt_secret.len(), GENERATED_SECRET_LEN);
    }

    #[test]
    fn test_template_parses_as_toml() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(config.port, 8080);
    }
}
