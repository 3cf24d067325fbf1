//! Delivers queued mail on a fixed tick, honouring each sender's quota.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hp_core::mail::quota::{check_quota, local_midnight, retry_delay, QuotaDecision, SendCounts, SendLimits};
use hp_core::mail::{MailTransport, OutboundMessage, TransportError};
use hp_db::models::MailQueueItem;
use hp_db::{queries, Database, DbError};
use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<sqlx::Error> for WorkerError {
    fn from(e: sqlx::Error) -> Self {
        Self::Db(DbError::from(e))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub tick: Duration,
    /// Items handled per tick.
    pub batch: i64,
    /// How long an item may sit in processing before it is handed back.
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            batch: 50,
            lease: Duration::from_secs(15 * 60),
        }
    }
}

/// Outcome counts for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sent: usize,
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed by someone else between selection and processing.
    pub skipped: usize,
    /// Stale processing items handed back before the batch.
    pub released: u64,
    /// Items whose processing hit an error. They stay queued.
    pub errors: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn saturating_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Quota verdict for `user_id` at `now`, from their package caps and the
/// send log. Users without a package are unlimited.
pub async fn quota_decision(
    pool: &SqlitePool,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<QuotaDecision, DbError> {
    let limits = match queries::package_for_user(pool, user_id).await? {
        Some(package) => SendLimits {
            hourly: saturating_u32(package.mail_hourly_limit),
            daily: saturating_u32(package.mail_daily_limit),
        },
        None => SendLimits { hourly: 0, daily: 0 },
    };
    if limits.hourly == 0 && limits.daily == 0 {
        return Ok(QuotaDecision::Send);
    }
    let last_hour = queries::count_sends_since(pool, user_id, now - ChronoDuration::hours(1)).await?;
    let today = queries::count_sends_since(pool, user_id, local_midnight(now)).await?;
    let counts = SendCounts {
        last_hour: saturating_u32(last_hour),
        today: saturating_u32(today),
    };
    Ok(check_quota(limits, counts, now))
}

fn to_message(item: &MailQueueItem) -> OutboundMessage {
    let headers = serde_json::from_str::<Vec<(String, String)>>(&item.headers).unwrap_or_else(|e| {
        warn!(mail_id = item.id, error = %e, "Unreadable stored headers, sending without them");
        Vec::new()
    });
    OutboundMessage {
        from: item.sender.clone(),
        to: item.recipient.clone(),
        subject: item.subject.clone(),
        body: item.body.clone(),
        headers,
    }
}

enum Outcome {
    Sent,
    Deferred,
    Retried,
    Failed,
    Skipped,
}

pub struct MailWorker<T: MailTransport> {
    db: Database,
    transport: T,
    config: WorkerConfig,
}

impl<T: MailTransport> MailWorker<T> {
    pub fn new(db: Database, transport: T, config: WorkerConfig) -> Self {
        Self {
            db,
            transport,
            config,
        }
    }

    /// Hands back items claimed before `claimed_before` that never finished.
    pub async fn release_stale(&self, claimed_before: DateTime<Utc>) -> Result<u64, WorkerError> {
        let released = queries::release_stale_mail(self.db.pool(), claimed_before).await?;
        if released > 0 {
            warn!(released, "Released mail left in processing");
        }
        Ok(released)
    }

    /// Tick until `shutdown` turns true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick.as_secs(),
            batch = self.config.batch,
            lease_secs = self.config.lease.as_secs(),
            "Mail worker started"
        );
        // Nothing else delivers from this queue, so every processing row
        // belongs to a run that died.
        if let Err(e) = self.release_stale(Utc::now()).await {
            error!(error = %e, "Failed to release interrupted mail");
        }
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let stop = shutdown.clone();
            match self.tick(Utc::now(), &stop).await {
                Ok(report) if report.is_empty() => debug!("Mail worker tick: nothing due"),
                Ok(report) => info!(
                    sent = report.sent,
                    deferred = report.deferred,
                    retried = report.retried,
                    failed = report.failed,
                    released = report.released,
                    errors = report.errors,
                    "Mail worker tick"
                ),
                Err(e) => error!(error = %e, "Mail worker tick failed"),
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Mail worker stopped");
    }

    /// One pass over the due items. Checks `shutdown` between items. An
    /// error on one item is logged and the rest of the batch still runs.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<TickReport, WorkerError> {
        let lease = ChronoDuration::from_std(self.config.lease).unwrap_or_else(|_| ChronoDuration::minutes(15));
        let mut report = TickReport {
            released: self.release_stale(now - lease).await?,
            ..Default::default()
        };
        let due = queries::due_mail(self.db.pool(), now, self.config.batch).await?;
        for item in due {
            if *shutdown.borrow() {
                debug!("Shutdown requested, leaving remaining items queued");
                break;
            }
            match self.process(&item, now).await {
                Ok(Outcome::Sent) => report.sent += 1,
                Ok(Outcome::Deferred) => report.deferred += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(mail_id = item.id, error = %e, "Failed to process queued mail");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn process(&self, item: &MailQueueItem, now: DateTime<Utc>) -> Result<Outcome, WorkerError> {
        let pool = self.db.pool();

        let decision = quota_decision(pool, item.user_id, now).await?;
        if let Some(at) = decision.scheduled_at() {
            queries::reschedule_mail(pool, item.id, at).await?;
            debug!(mail_id = item.id, scheduled_at = %at, "Quota reached, rescheduled");
            return Ok(Outcome::Deferred);
        }

        if !queries::claim_mail(pool, item.id).await? {
            return Ok(Outcome::Skipped);
        }

        match self.transport.send(&to_message(item)).await {
            Ok(()) => {
                let mut tx = self.db.begin().await?;
                queries::delete_mail(&mut *tx, item.id).await?;
                queries::record_send(&mut *tx, item.user_id, &item.recipient, now).await?;
                tx.commit().await?;
                info!(mail_id = item.id, to = %item.recipient, "Queued mail delivered");
                Ok(Outcome::Sent)
            }
            Err(TransportError::InvalidMessage(reason)) => {
                queries::fail_mail(pool, item.id, item.max_retries.max(item.retry_count), &reason).await?;
                warn!(mail_id = item.id, reason = %reason, "Queued mail is undeliverable");
                Ok(Outcome::Failed)
            }
            Err(e) => {
                let retry_count = item.retry_count + 1;
                let message = e.to_string();
                if retry_count >= item.max_retries {
                    queries::fail_mail(pool, item.id, retry_count, &message).await?;
                    warn!(mail_id = item.id, retry_count, error = %message, "Queued mail failed permanently");
                    Ok(Outcome::Failed)
                } else {
                    let at = now + retry_delay(u32::try_from(retry_count).unwrap_or(u32::MAX));
                    queries::retry_mail(pool, item.id, retry_count, at, &message).await?;
                    warn!(mail_id = item.id, retry_count, scheduled_at = %at, error = %message, "Queued mail will be retried");
                    Ok(Outcome::Retried)
                }
            }
        }
    }
}
