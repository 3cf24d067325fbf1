//! Operation entry points. Each service validates and authorises a request,
//! then drives the host primitives and the metadata store.

pub mod accounts;
pub mod context;
pub mod error;
pub mod install;
pub mod mail;
pub mod php;
pub mod shell;
pub mod ssl;

pub use accounts::{AccountError, AccountOrchestrator, CreateAccount, DeletionReport};
pub use context::{Actor, HostContext, HostSettings};
pub use error::ErrorKind;
pub use install::{InstallService, InstallServiceError, PhpVersions, TaskStarted};
pub use mail::{MailSendError, MailService, SendOutcome};
pub use php::{PhpSettingsError, PhpSettingsService};
pub use shell::{OpenShell, ShellError, ShellService};
pub use ssl::{SslService, SslServiceError};
