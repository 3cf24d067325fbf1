use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Role {
    Admin,
    Reseller,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Reseller => "reseller",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "reseller" => Ok(Self::Reseller),
            "user" => Ok(Self::User),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub parent_id: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub role: Role,
    pub parent_id: Option<i64>,
}

/// Capacity template. Zero (or an empty string for PHP sizes) means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct Package {
    pub id: i64,
    pub name: String,
    pub disk_quota_mb: i64,
    pub bandwidth_quota_mb: i64,
    pub max_domains: i64,
    pub max_subdomains: i64,
    pub max_databases: i64,
    pub max_email_accounts: i64,
    pub max_ftp_accounts: i64,
    pub max_php_memory: String,
    pub max_php_upload: String,
    pub max_php_execution_time: i64,
    pub mail_hourly_limit: i64,
    pub mail_daily_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Domain {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub document_root: String,
    pub php_version: String,
    /// JSON object of INI overrides.
    pub php_ini: String,
    pub ssl_enabled: bool,
    pub force_https: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDomain<'a> {
    pub user_id: i64,
    pub name: &'a str,
    pub document_root: &'a str,
    pub php_version: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subdomain {
    pub id: i64,
    pub domain_id: i64,
    pub name: String,
    pub document_root: String,
    pub php_version: Option<String>,
    pub proxy_port: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DnsRecord {
    pub id: i64,
    pub domain_id: i64,
    pub name: String,
    pub record_type: String,
    pub content: String,
    pub ttl: i64,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewDnsRecord {
    pub name: String,
    pub record_type: String,
    pub content: String,
    pub ttl: i64,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DatabaseRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailAccount {
    pub id: i64,
    pub user_id: i64,
    pub domain_id: i64,
    pub local_part: String,
    pub quota_mb: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum MailState {
    Pending,
    Processing,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailQueueItem {
    pub id: i64,
    pub user_id: i64,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// JSON array of `[name, value]` pairs.
    pub headers: String,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub scheduled_at: DateTime<Utc>,
    pub state: MailState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMail<'a> {
    pub user_id: i64,
    pub sender: &'a str,
    pub recipient: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub headers: &'a str,
    pub priority: i64,
    pub max_retries: i64,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityLog {
    pub id: i64,
    pub actor_id: Option<i64>,
    pub action: String,
    pub target: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServerSetting {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
