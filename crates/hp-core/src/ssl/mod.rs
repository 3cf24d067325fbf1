//! Certificate inspection and ACME issuance.

pub mod cert;
pub mod manager;

pub use cert::{CertError, CertificateInfo, SslStatus};
pub use manager::{CertificateStatus, FqdnRole, SslError, SslManager, ACME_LIVE_DIR, STANDARD_SUBDOMAINS};
