//! Outbound mail quota arithmetic.
//!
//! Limits come from the sender's package; counts come from the send log.
//! Zero means unlimited.

use chrono::{DateTime, Duration, DurationRound, Local, TimeZone, Utc};

/// Spacing between retries of a failed delivery, multiplied by the retry count.
pub const RETRY_STEP_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendLimits {
    pub hourly: u32,
    pub daily: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCounts {
    /// Sends in the trailing hour.
    pub last_hour: u32,
    /// Sends since local midnight.
    pub today: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Send,
    /// Hourly cap reached; try again at the given instant.
    DeferHourly(DateTime<Utc>),
    /// Daily cap reached; try again at the given instant.
    DeferDaily(DateTime<Utc>),
}

impl QuotaDecision {
    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Send => None,
            Self::DeferHourly(at) | Self::DeferDaily(at) => Some(*at),
        }
    }
}

/// Whether one more message may go out now. A daily breach wins over an
/// hourly one since it defers further.
pub fn check_quota(limits: SendLimits, counts: SendCounts, now: DateTime<Utc>) -> QuotaDecision {
    if limits.daily > 0 && counts.today >= limits.daily {
        return QuotaDecision::DeferDaily(next_local_midnight(now));
    }
    if limits.hourly > 0 && counts.last_hour >= limits.hourly {
        return QuotaDecision::DeferHourly(next_hour_boundary(now));
    }
    QuotaDecision::Send
}

/// Start of the next UTC hour.
pub fn next_hour_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .duration_trunc(Duration::hours(1))
        .unwrap_or(now);
    truncated + Duration::hours(1)
}

/// Start of the current local day, expressed in UTC.
pub fn local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Start of the next local day, expressed in UTC.
pub fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    local
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or_else(|| now + Duration::days(1))
}

/// Delay before the next attempt after `retry_count` failures.
pub fn retry_delay(retry_count: u32) -> Duration {
    Duration::minutes(RETRY_STEP_MINUTES * i64::from(retry_count))
}
