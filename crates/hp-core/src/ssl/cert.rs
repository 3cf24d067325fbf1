use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::x509::X509Name;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to parse certificate PEM: {0}")]
    Pem(String),
    #[error("Failed to parse X.509 certificate: {0}")]
    X509(String),
    #[error("Certificate validity out of range")]
    Validity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslStatus {
    Active,
    Expired,
    /// Not yet valid.
    Pending,
    None,
}

/// The fields of a leaf certificate the panel reports on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub sans: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

fn common_name_or_full(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| name.to_string())
}

fn sans_of(cert: &X509Certificate<'_>) -> Result<Vec<String>, CertError> {
    let mut sans = Vec::new();
    let ext = cert
        .subject_alternative_name()
        .map_err(|e| CertError::X509(e.to_string()))?;
    if let Some(ext) = ext {
        for name in &ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                sans.push(dns.to_ascii_lowercase());
            }
        }
    }
    Ok(sans)
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, CertError> {
    DateTime::from_timestamp(timestamp, 0).ok_or(CertError::Validity)
}

impl CertificateInfo {
    /// Parse the first certificate of a PEM bundle such as `fullchain.pem`.
    pub fn from_pem(input: &str) -> Result<Self, CertError> {
        let blocks = pem::parse_many(input).map_err(|e| CertError::Pem(e.to_string()))?;
        let leaf = blocks
            .iter()
            .find(|b| b.tag() == "CERTIFICATE")
            .ok_or_else(|| CertError::Pem("no CERTIFICATE block".to_string()))?;

        let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents())
            .map_err(|e| CertError::X509(e.to_string()))?;

        let validity = cert.validity();
        Ok(Self {
            subject: common_name_or_full(cert.subject()),
            issuer: common_name_or_full(cert.issuer()),
            sans: sans_of(&cert)?,
            not_before: to_utc(validity.not_before.timestamp())?,
            not_after: to_utc(validity.not_after.timestamp())?,
        })
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> SslStatus {
        if now < self.not_before {
            SslStatus::Pending
        } else if now > self.not_after {
            SslStatus::Expired
        } else {
            SslStatus::Active
        }
    }

    /// Whether a SAN names `fqdn` exactly or through a one-level wildcard.
    pub fn covers(&self, fqdn: &str) -> bool {
        let fqdn = fqdn.to_ascii_lowercase();
        self.sans.iter().any(|san| {
            if san == &fqdn {
                return true;
            }
            match (san.strip_prefix("*."), fqdn.split_once('.')) {
                (Some(base), Some((label, rest))) => !label.is_empty() && rest == base,
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EXAMPLE_COM: &str = include_str!("testdata/example.com.pem");
    const WILDCARD_EXAMPLE_ORG: &str = include_str!("testdata/wildcard.example.org.pem");

    #[test]
    fn test_parse_fields() {
        let info = CertificateInfo::from_pem(EXAMPLE_COM).unwrap();
        assert_eq!(info.subject, "example.com");
        assert_eq!(info.issuer, "example.com");
        assert_eq!(info.sans, vec!["example.com", "www.example.com"]);
        assert_eq!(info.not_before, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(info.not_after, Utc.with_ymd_and_hms(2035, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_status_window() {
        let info = CertificateInfo::from_pem(EXAMPLE_COM).unwrap();
        let at = |y| Utc.with_ymd_and_hms(y, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(info.status_at(at(2024)), SslStatus::Pending);
        assert_eq!(info.status_at(at(2030)), SslStatus::Active);
        assert_eq!(info.status_at(at(2036)), SslStatus::Expired);
    }

    #[test]
    fn test_direct_coverage() {
        let info = CertificateInfo::from_pem(EXAMPLE_COM).unwrap();
        assert!(info.covers("www.example.com"));
        assert!(info.covers("WWW.example.com"));
        assert!(!info.covers("mail.example.com"));
    }

    #[test]
    fn test_wildcard_covers_one_level_only() {
        let info = CertificateInfo::from_pem(WILDCARD_EXAMPLE_ORG).unwrap();
        assert!(info.covers("mail.example.org"));
        assert!(info.covers("example.org"));
        assert!(!info.covers("a.b.example.org"));
        assert!(!info.covers("example.net"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(CertificateInfo::from_pem("not a certificate").is_err());
    }
}
