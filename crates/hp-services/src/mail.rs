//! Outbound mail from panel users, sent straight away or queued when the
//! sender's package quota is used up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use hp_actors::mail_worker::quota_decision;
use hp_core::mail::{MailTransport, OutboundMessage, TransportError};
use hp_db::models::NewMail;
use hp_db::{queries, Database, DbError};

use crate::context::Actor;
use crate::error::{db_kind, ErrorKind};

const QUEUED_PRIORITY: i64 = 5;
const QUEUED_MAX_RETRIES: i64 = 3;

#[derive(Debug, Error)]
pub enum MailSendError {
    #[error("{0}")]
    Validation(String),
    #[error("Access denied")]
    Forbidden,
    #[error("Account is suspended: {0}")]
    Suspended(String),
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl MailSendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Forbidden | Self::Suspended(_) => ErrorKind::Forbidden,
            Self::Transport(_) => ErrorKind::Internal,
            Self::Database(e) => db_kind(e),
        }
    }
}

impl From<TransportError> for MailSendError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidMessage(reason) => Self::Validation(reason),
            other => Self::Transport(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent,
    Queued { id: i64, scheduled_at: DateTime<Utc> },
}

fn sender_domain(from: &str) -> Option<&str> {
    from.rsplit_once('@').map(|(_, domain)| domain)
}

pub struct MailService<T: MailTransport> {
    db: Database,
    transport: T,
}

impl<T: MailTransport> MailService<T> {
    pub fn new(db: Database, transport: T) -> Self {
        Self { db, transport }
    }

    pub async fn send(&self, actor: &Actor, message: OutboundMessage) -> Result<SendOutcome, MailSendError> {
        self.send_at(actor, message, Utc::now()).await
    }

    /// Deliver `message` for `actor` if their quota allows it at `now`,
    /// otherwise queue it for when the quota frees up.
    pub async fn send_at(
        &self,
        actor: &Actor,
        message: OutboundMessage,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, MailSendError> {
        message.validate()?;
        let pool = self.db.pool();

        let sender = queries::get_user(pool, actor.id).await?;
        if !sender.is_active {
            return Err(MailSendError::Suspended(sender.username));
        }
        if !actor.is_admin() {
            let domain = sender_domain(&message.from).unwrap_or_default().to_ascii_lowercase();
            let owned = match queries::find_domain_by_name(pool, &domain).await? {
                Some(d) => actor.can_manage(&queries::get_user(pool, d.user_id).await?),
                None => false,
            };
            if !owned {
                return Err(MailSendError::Forbidden);
            }
        }

        let decision = quota_decision(pool, actor.id, now).await?;
        if let Some(at) = decision.scheduled_at() {
            let headers = serde_json::to_string(&message.headers)
                .map_err(|e| MailSendError::Validation(e.to_string()))?;
            let id = queries::enqueue_mail(
                pool,
                &NewMail {
                    user_id: actor.id,
                    sender: &message.from,
                    recipient: &message.to,
                    subject: &message.subject,
                    body: &message.body,
                    headers: &headers,
                    priority: QUEUED_PRIORITY,
                    max_retries: QUEUED_MAX_RETRIES,
                    scheduled_at: at,
                },
            )
            .await?;
            info!(user = %actor.username, mail_id = id, scheduled_at = %at, "Send quota reached, mail queued");
            return Ok(SendOutcome::Queued { id, scheduled_at: at });
        }

        self.transport.send(&message).await?;
        queries::record_send(pool, actor.id, &message.to, now).await?;
        info!(user = %actor.username, to = %message.to, "Mail sent");
        Ok(SendOutcome::Sent)
    }
}
