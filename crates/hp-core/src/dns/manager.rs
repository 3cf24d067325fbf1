use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use super::zone::{default_records, next_serial, parse_serial, render_zone, ZoneRecord};
use crate::exec::CommandRunner;
use crate::fs::atomic::{atomic_write_config, remove_if_exists, AtomicWriteError};
use crate::fs::lines::{append_line_if_absent, remove_lines_where};
use crate::fs::HostPaths;
use crate::service::ServiceManager;

/// Zone declarations for panel-managed domains, one per line. The operator
/// includes this file from `named.conf.local`.
pub const ZONE_INCLUDE_FILE: &str = "/etc/bind/named.conf.hostpanel";

const DNS_SERVICE: &str = "bind9";

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("Failed to write zone: {0}")]
    Write(#[from] AtomicWriteError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Authoritative zone files under the configured zones directory.
#[derive(Debug, Clone)]
pub struct ZoneManager {
    paths: HostPaths,
    services: ServiceManager,
    nameservers: Vec<String>,
}

impl ZoneManager {
    pub fn new(runner: CommandRunner, paths: HostPaths, nameservers: Vec<String>) -> Self {
        Self {
            services: ServiceManager::new(runner),
            paths,
            nameservers,
        }
    }

    pub fn nameservers(&self) -> &[String] {
        &self.nameservers
    }

    /// Logical `<zones-dir>/db.<domain>`.
    pub fn zone_path(&self, domain: &str) -> PathBuf {
        self.paths.zones_dir().join(format!("db.{}", domain))
    }

    pub fn zone_exists(&self, domain: &str) -> bool {
        self.paths.resolve(self.zone_path(domain)).exists()
    }

    fn declaration(&self, domain: &str) -> String {
        format!(
            "zone \"{}\" {{ type master; file \"{}\"; }};",
            domain,
            self.zone_path(domain).display()
        )
    }

    fn declares(line: &str, domain: &str) -> bool {
        line.trim_start()
            .starts_with(&format!("zone \"{}\" ", domain))
    }

    /// Render and write the zone with a serial above any previous one, then
    /// reload. Returns the serial written. A refused reload leaves the file
    /// in place.
    pub async fn write_zone(&self, domain: &str, records: &[ZoneRecord]) -> Result<u64, ZoneError> {
        let path = self.paths.resolve(self.zone_path(domain));
        let previous = match fs::read_to_string(&path) {
            Ok(content) => parse_serial(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let serial = next_serial(previous, Utc::now());

        let content = render_zone(domain, serial, &self.nameservers, records);
        atomic_write_config(&path, &content)?;

        let declaration = self.declaration(domain);
        append_line_if_absent(
            &self.paths.resolve(ZONE_INCLUDE_FILE),
            &declaration,
            0o644,
            |line| Self::declares(line, domain),
        )?;

        self.reload().await;
        info!(domain, serial, records = records.len(), "Zone written");
        Ok(serial)
    }

    /// Write the default record set for a new domain.
    pub async fn create_default_zone(
        &self,
        domain: &str,
        server_ip: &str,
    ) -> Result<Vec<ZoneRecord>, ZoneError> {
        let records = default_records(domain, server_ip, &self.nameservers);
        self.write_zone(domain, &records).await?;
        Ok(records)
    }

    /// Remove the zone file and its declaration. Missing pieces are fine.
    pub async fn delete_zone(&self, domain: &str) -> Result<bool, ZoneError> {
        let removed = remove_if_exists(&self.paths.resolve(self.zone_path(domain)))?;
        let undeclared = remove_lines_where(&self.paths.resolve(ZONE_INCLUDE_FILE), 0o644, |line| {
            Self::declares(line, domain)
        })?;
        if removed || undeclared > 0 {
            self.reload().await;
            info!(domain, "Zone deleted");
        }
        Ok(removed)
    }

    pub async fn reload(&self) -> Option<String> {
        self.services.reload_lenient(DNS_SERVICE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::zone::RecordType;
    use tempfile::TempDir;

    fn manager() -> (TempDir, CommandRunner, ZoneManager) {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::simulated();
        let zones = ZoneManager::new(
            runner.clone(),
            HostPaths::rebased(dir.path()),
            vec!["ns1.panel.example".to_string(), "ns2.panel.example".to_string()],
        );
        (dir, runner, zones)
    }

    #[tokio::test]
    async fn test_create_default_zone() {
        let (dir, runner, zones) = manager();
        let records = zones.create_default_zone("alice.example", "203.0.113.10").await.unwrap();
        assert_eq!(records.len(), 9);

        let file = dir.path().join("etc/bind/zones/db.alice.example");
        let content = fs::read_to_string(file).unwrap();
        assert!(content.contains("$ORIGIN alice.example."));
        assert!(zones.zone_exists("alice.example"));

        let include = fs::read_to_string(dir.path().join("etc/bind/named.conf.hostpanel")).unwrap();
        assert_eq!(
            include,
            "zone \"alice.example\" { type master; file \"/etc/bind/zones/db.alice.example\"; };\n"
        );
        assert_eq!(runner.journal(), vec!["systemctl reload bind9"]);
    }

    #[tokio::test]
    async fn test_successive_writes_increase_serial() {
        let (_dir, _runner, zones) = manager();
        let records = vec![ZoneRecord::new("@", RecordType::A, "203.0.113.10")];
        let first = zones.write_zone("alice.example", &records).await.unwrap();
        let second = zones.write_zone("alice.example", &records).await.unwrap();
        let third = zones.write_zone("alice.example", &records).await.unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn test_delete_zone_is_symmetric() {
        let (dir, _runner, zones) = manager();
        zones.create_default_zone("alice.example", "203.0.113.10").await.unwrap();
        zones.create_default_zone("bob.example", "203.0.113.10").await.unwrap();

        assert!(zones.delete_zone("alice.example").await.unwrap());
        assert!(!zones.zone_exists("alice.example"));
        assert!(!zones.delete_zone("alice.example").await.unwrap());

        let include = fs::read_to_string(dir.path().join("etc/bind/named.conf.hostpanel")).unwrap();
        assert!(!include.contains("alice.example"));
        assert!(include.contains("bob.example"));
    }
}
