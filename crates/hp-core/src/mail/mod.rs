//! Mail stack: virtual tables, DKIM, mailbox hashes, outbound quota and the MTA hand-off.

pub mod dkim;
pub mod opendkim;
pub mod password;
pub mod quota;
pub mod registrar;
pub mod transport;

pub use dkim::{DkimError, DkimKeys};
pub use opendkim::{DkimEntry, DkimTables};
pub use quota::{check_quota, QuotaDecision, SendCounts, SendLimits};
pub use registrar::{DomainRegistration, MailError, MailRegistrar};
pub use transport::{MailTransport, OutboundMessage, SendmailTransport, TransportError};
