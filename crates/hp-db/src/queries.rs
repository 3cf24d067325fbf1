//! Free query functions. Single-statement queries are generic over
//! `SqliteExecutor` so they run on the pool or inside a transaction;
//! multi-statement ones take a connection (`&mut *tx` works).
//!
//! Timestamps are stored as RFC 3339 text whose fractional part varies in
//! length, so time comparisons go through `julianday()`.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqliteExecutor};
use tracing::debug;

use crate::models::*;
use crate::pool::{map_unique, DbError};

const USER_COLUMNS: &str =
    "id, username, email, password_hash, role, parent_id, is_active, created_at, updated_at";

const PACKAGE_COLUMNS: &str = "id, name, disk_quota_mb, bandwidth_quota_mb, max_domains, \
     max_subdomains, max_databases, max_email_accounts, max_ftp_accounts, max_php_memory, \
     max_php_upload, max_php_execution_time, mail_hourly_limit, mail_daily_limit";

const DOMAIN_COLUMNS: &str = "id, user_id, name, document_root, php_version, php_ini, \
     ssl_enabled, force_https, is_active, created_at";

const MAIL_COLUMNS: &str = "id, user_id, sender, recipient, subject, body, headers, priority, \
     retry_count, max_retries, scheduled_at, state, last_error, created_at, updated_at";

// ============================================================
// Users
// ============================================================

pub async fn create_user<'e, E>(executor: E, user: &NewUser<'_>) -> Result<i64, DbError>
where
    E: SqliteExecutor<'e>,
{
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO users (username, email, password_hash, role, parent_id, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(user.username)
    .bind(user.email)
    .bind(user.password_hash)
    .bind(user.role)
    .bind(user.parent_id)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| map_unique(e, || format!("User already exists: {}", user.username)))?;

    debug!(username = user.username, "Created user row");
    Ok(result.last_insert_rowid())
}

pub async fn get_user<'e, E>(executor: E, id: i64) -> Result<User, DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("User with id {}", id)))
}

pub async fn find_user_by_username<'e, E>(executor: E, username: &str) -> Result<Option<User>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(
        sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE username = ?", USER_COLUMNS))
            .bind(username)
            .fetch_optional(executor)
            .await?,
    )
}

pub async fn list_users<'e, E>(executor: E) -> Result<Vec<User>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(
        sqlx::query_as::<_, User>(&format!("SELECT {} FROM users ORDER BY username", USER_COLUMNS))
            .fetch_all(executor)
            .await?,
    )
}

/// Accounts created by a reseller.
pub async fn list_users_by_parent<'e, E>(executor: E, parent_id: i64) -> Result<Vec<User>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, User>(&format!(
        "SELECT {} FROM users WHERE parent_id = ? ORDER BY username",
        USER_COLUMNS
    ))
    .bind(parent_id)
    .fetch_all(executor)
    .await?)
}

pub async fn set_user_active<'e, E>(executor: E, id: i64, active: bool) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")
        .bind(active)
        .bind(Utc::now())
        .bind(id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("User with id {}", id)));
    }
    Ok(())
}

/// Delete a user and every row that belongs to it, children first.
pub async fn delete_user_tree(conn: &mut SqliteConnection, id: i64) -> Result<(), DbError> {
    const CHILD_DELETES: &[&str] = &[
        "DELETE FROM email_autoresponders WHERE email_account_id IN \
         (SELECT id FROM email_accounts WHERE user_id = ?)",
        "DELETE FROM email_accounts WHERE user_id = ?",
        "DELETE FROM email_forwarders WHERE user_id = ?",
        "DELETE FROM email_settings WHERE user_id = ?",
        "DELETE FROM mail_queue WHERE user_id = ?",
        "DELETE FROM email_send_log WHERE user_id = ?",
        "DELETE FROM nodejs_apps WHERE user_id = ?",
        "DELETE FROM dns_records WHERE domain_id IN (SELECT id FROM domains WHERE user_id = ?)",
        "DELETE FROM subdomains WHERE domain_id IN (SELECT id FROM domains WHERE user_id = ?)",
        "DELETE FROM domains WHERE user_id = ?",
        "DELETE FROM databases WHERE user_id = ?",
        "DELETE FROM database_users WHERE user_id = ?",
        "DELETE FROM cron_jobs WHERE user_id = ?",
        "DELETE FROM ftp_accounts WHERE user_id = ?",
        "DELETE FROM user_packages WHERE user_id = ?",
    ];
    for statement in CHILD_DELETES {
        sqlx::query(statement).bind(id).execute(&mut *conn).await?;
    }

    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("User with id {}", id)));
    }
    debug!(user_id = id, "Deleted user tree");
    Ok(())
}

// ============================================================
// Packages
// ============================================================

/// Insert a package; `package.id` is ignored.
pub async fn create_package<'e, E>(executor: E, package: &Package) -> Result<i64, DbError>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "INSERT INTO packages (name, disk_quota_mb, bandwidth_quota_mb, max_domains, max_subdomains, \
         max_databases, max_email_accounts, max_ftp_accounts, max_php_memory, max_php_upload, \
         max_php_execution_time, mail_hourly_limit, mail_daily_limit, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&package.name)
    .bind(package.disk_quota_mb)
    .bind(package.bandwidth_quota_mb)
    .bind(package.max_domains)
    .bind(package.max_subdomains)
    .bind(package.max_databases)
    .bind(package.max_email_accounts)
    .bind(package.max_ftp_accounts)
    .bind(&package.max_php_memory)
    .bind(&package.max_php_upload)
    .bind(package.max_php_execution_time)
    .bind(package.mail_hourly_limit)
    .bind(package.mail_daily_limit)
    .bind(Utc::now())
    .execute(executor)
    .await
    .map_err(|e| map_unique(e, || format!("Package already exists: {}", package.name)))?;
    Ok(result.last_insert_rowid())
}

pub async fn get_package<'e, E>(executor: E, id: i64) -> Result<Package, DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, Package>(&format!("SELECT {} FROM packages WHERE id = ?", PACKAGE_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Package with id {}", id)))
}

pub async fn find_package_by_name<'e, E>(executor: E, name: &str) -> Result<Option<Package>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, Package>(&format!(
        "SELECT {} FROM packages WHERE name = ?",
        PACKAGE_COLUMNS
    ))
    .bind(name)
    .fetch_optional(executor)
    .await?)
}

pub async fn assign_package<'e, E>(executor: E, user_id: i64, package_id: i64) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("INSERT INTO user_packages (user_id, package_id, assigned_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(package_id)
        .bind(Utc::now())
        .execute(executor)
        .await
        .map_err(|e| map_unique(e, || format!("User {} already has a package", user_id)))?;
    Ok(())
}

pub async fn package_for_user<'e, E>(executor: E, user_id: i64) -> Result<Option<Package>, DbError>
where
    E: SqliteExecutor<'e>,
{
    let columns = PACKAGE_COLUMNS
        .split(", ")
        .map(|c| format!("p.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(sqlx::query_as::<_, Package>(&format!(
        "SELECT {} FROM packages p JOIN user_packages up ON up.package_id = p.id WHERE up.user_id = ?",
        columns
    ))
    .bind(user_id)
    .fetch_optional(executor)
    .await?)
}

// ============================================================
// Domains, subdomains, DNS records
// ============================================================

pub async fn create_domain<'e, E>(executor: E, domain: &NewDomain<'_>) -> Result<i64, DbError>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "INSERT INTO domains (user_id, name, document_root, php_version, php_ini, created_at) \
         VALUES (?, ?, ?, ?, '{}', ?)",
    )
    .bind(domain.user_id)
    .bind(domain.name)
    .bind(domain.document_root)
    .bind(domain.php_version)
    .bind(Utc::now())
    .execute(executor)
    .await
    .map_err(|e| map_unique(e, || format!("Domain already exists: {}", domain.name)))?;

    debug!(domain = domain.name, "Created domain row");
    Ok(result.last_insert_rowid())
}

pub async fn get_domain<'e, E>(executor: E, id: i64) -> Result<Domain, DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, Domain>(&format!("SELECT {} FROM domains WHERE id = ?", DOMAIN_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Domain with id {}", id)))
}

pub async fn find_domain_by_name<'e, E>(executor: E, name: &str) -> Result<Option<Domain>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(
        sqlx::query_as::<_, Domain>(&format!("SELECT {} FROM domains WHERE name = ?", DOMAIN_COLUMNS))
            .bind(name)
            .fetch_optional(executor)
            .await?,
    )
}

pub async fn domains_for_user<'e, E>(executor: E, user_id: i64) -> Result<Vec<Domain>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, Domain>(&format!(
        "SELECT {} FROM domains WHERE user_id = ? ORDER BY id",
        DOMAIN_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(executor)
    .await?)
}

pub async fn all_domains<'e, E>(executor: E) -> Result<Vec<Domain>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(
        sqlx::query_as::<_, Domain>(&format!("SELECT {} FROM domains ORDER BY name", DOMAIN_COLUMNS))
            .fetch_all(executor)
            .await?,
    )
}

pub async fn set_domain_ssl<'e, E>(executor: E, id: i64, enabled: bool) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE domains SET ssl_enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Domain with id {}", id)));
    }
    Ok(())
}

pub async fn set_domain_php_ini<'e, E>(executor: E, id: i64, php_ini: &str) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query("UPDATE domains SET php_ini = ? WHERE id = ?")
        .bind(php_ini)
        .bind(id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound(format!("Domain with id {}", id)));
    }
    Ok(())
}

pub async fn subdomains_for_domain<'e, E>(executor: E, domain_id: i64) -> Result<Vec<Subdomain>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, Subdomain>(
        "SELECT id, domain_id, name, document_root, php_version, proxy_port, created_at \
         FROM subdomains WHERE domain_id = ? ORDER BY name",
    )
    .bind(domain_id)
    .fetch_all(executor)
    .await?)
}

pub async fn insert_dns_records(
    conn: &mut SqliteConnection,
    domain_id: i64,
    records: &[NewDnsRecord],
) -> Result<(), DbError> {
    for record in records {
        sqlx::query(
            "INSERT OR IGNORE INTO dns_records (domain_id, name, record_type, content, ttl, priority) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(domain_id)
        .bind(&record.name)
        .bind(&record.record_type)
        .bind(&record.content)
        .bind(record.ttl)
        .bind(record.priority)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn dns_records_for_domain<'e, E>(executor: E, domain_id: i64) -> Result<Vec<DnsRecord>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, DnsRecord>(
        "SELECT id, domain_id, name, record_type, content, ttl, priority \
         FROM dns_records WHERE domain_id = ? ORDER BY id",
    )
    .bind(domain_id)
    .fetch_all(executor)
    .await?)
}

// ============================================================
// Databases and mail accounts
// ============================================================

pub async fn databases_for_user<'e, E>(executor: E, user_id: i64) -> Result<Vec<DatabaseRecord>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, DatabaseRecord>(
        "SELECT id, user_id, name, created_at FROM databases WHERE user_id = ? ORDER BY name",
    )
    .bind(user_id)
    .fetch_all(executor)
    .await?)
}

pub async fn email_accounts_for_user<'e, E>(executor: E, user_id: i64) -> Result<Vec<EmailAccount>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, EmailAccount>(
        "SELECT id, user_id, domain_id, local_part, quota_mb, created_at \
         FROM email_accounts WHERE user_id = ? ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(executor)
    .await?)
}

// ============================================================
// Mail queue and send log
// ============================================================

pub async fn enqueue_mail<'e, E>(executor: E, mail: &NewMail<'_>) -> Result<i64, DbError>
where
    E: SqliteExecutor<'e>,
{
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO mail_queue (user_id, sender, recipient, subject, body, headers, priority, \
         retry_count, max_retries, scheduled_at, state, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 'pending', ?, ?)",
    )
    .bind(mail.user_id)
    .bind(mail.sender)
    .bind(mail.recipient)
    .bind(mail.subject)
    .bind(mail.body)
    .bind(mail.headers)
    .bind(mail.priority)
    .bind(mail.max_retries)
    .bind(mail.scheduled_at)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;

    debug!(user_id = mail.user_id, scheduled_at = %mail.scheduled_at, "Queued mail");
    Ok(result.last_insert_rowid())
}

pub async fn get_mail<'e, E>(executor: E, id: i64) -> Result<MailQueueItem, DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query_as::<_, MailQueueItem>(&format!("SELECT {} FROM mail_queue WHERE id = ?", MAIL_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("Mail queue item {}", id)))
}

/// Pending items whose time has come, most urgent first.
pub async fn due_mail<'e, E>(executor: E, now: DateTime<Utc>, limit: i64) -> Result<Vec<MailQueueItem>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, MailQueueItem>(&format!(
        "SELECT {} FROM mail_queue WHERE state = 'pending' AND julianday(scheduled_at) <= julianday(?) \
         ORDER BY priority ASC, created_at ASC LIMIT ?",
        MAIL_COLUMNS
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await?)
}

pub async fn mail_for_user<'e, E>(executor: E, user_id: i64) -> Result<Vec<MailQueueItem>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, MailQueueItem>(&format!(
        "SELECT {} FROM mail_queue WHERE user_id = ? ORDER BY id",
        MAIL_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(executor)
    .await?)
}

/// Move a pending item to processing. Returns false when another worker
/// got there first.
pub async fn claim_mail<'e, E>(executor: E, id: i64) -> Result<bool, DbError>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE mail_queue SET state = 'processing', updated_at = ? WHERE id = ? AND state = 'pending'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Releases items left in processing since before `claimed_before`, counting
/// the interrupted attempt. Items out of retries fail instead. Returns how
/// many rows moved.
pub async fn release_stale_mail<'e, E>(executor: E, claimed_before: DateTime<Utc>) -> Result<u64, DbError>
where
    E: SqliteExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE mail_queue SET \
         state = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END, \
         retry_count = retry_count + 1, \
         last_error = 'Delivery interrupted', updated_at = ? \
         WHERE state = 'processing' AND julianday(updated_at) <= julianday(?)",
    )
    .bind(Utc::now())
    .bind(claimed_before)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Back to pending at `at` without touching the retry count (quota deferral).
pub async fn reschedule_mail<'e, E>(executor: E, id: i64, at: DateTime<Utc>) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("UPDATE mail_queue SET state = 'pending', scheduled_at = ?, updated_at = ? WHERE id = ?")
        .bind(at)
        .bind(Utc::now())
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Back to pending after a delivery failure.
pub async fn retry_mail<'e, E>(
    executor: E,
    id: i64,
    retry_count: i64,
    at: DateTime<Utc>,
    error: &str,
) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "UPDATE mail_queue SET state = 'pending', retry_count = ?, scheduled_at = ?, last_error = ?, \
         updated_at = ? WHERE id = ?",
    )
    .bind(retry_count)
    .bind(at)
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn fail_mail<'e, E>(executor: E, id: i64, retry_count: i64, error: &str) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "UPDATE mail_queue SET state = 'failed', retry_count = ?, last_error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(retry_count)
    .bind(error)
    .bind(Utc::now())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_mail<'e, E>(executor: E, id: i64) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("DELETE FROM mail_queue WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn record_send<'e, E>(
    executor: E,
    user_id: i64,
    recipient: &str,
    at: DateTime<Utc>,
) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("INSERT INTO email_send_log (user_id, recipient, sent_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(recipient)
        .bind(at)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn count_sends_since<'e, E>(executor: E, user_id: i64, since: DateTime<Utc>) -> Result<i64, DbError>
where
    E: SqliteExecutor<'e>,
{
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM email_send_log WHERE user_id = ? AND julianday(sent_at) >= julianday(?)")
            .bind(user_id)
            .bind(since)
            .fetch_one(executor)
            .await?;
    Ok(count)
}

// ============================================================
// Activity log and server settings
// ============================================================

pub async fn log_activity<'e, E>(
    executor: E,
    actor_id: Option<i64>,
    action: &str,
    target: &str,
    details: Option<&str>,
) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO activity_logs (actor_id, action, target, details, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(actor_id)
    .bind(action)
    .bind(target)
    .bind(details)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn recent_activity<'e, E>(executor: E, limit: i64) -> Result<Vec<ActivityLog>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_as::<_, ActivityLog>(
        "SELECT id, actor_id, action, target, details, created_at FROM activity_logs \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(executor)
    .await?)
}

pub async fn get_setting<'e, E>(executor: E, key: &str) -> Result<Option<String>, DbError>
where
    E: SqliteExecutor<'e>,
{
    Ok(sqlx::query_scalar("SELECT value FROM server_settings WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await?)
}

pub async fn set_setting<'e, E>(executor: E, key: &str, value: &str) -> Result<(), DbError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO server_settings (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Database;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn test_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("panel.db")).await.unwrap();
        db.migrate().await.unwrap();
        (dir, db)
    }

    fn new_user(username: &str) -> NewUser<'_> {
        NewUser {
            username,
            email: "owner@example.com",
            password_hash: "$2b$04$hash",
            role: Role::User,
            parent_id: None,
        }
    }

    fn starter() -> Package {
        Package {
            name: "Starter".to_string(),
            max_domains: 1,
            max_php_memory: "256M".to_string(),
            max_php_upload: "64M".to_string(),
            max_php_execution_time: 300,
            mail_hourly_limit: 2,
            mail_daily_limit: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_user_round_trip_and_duplicate() {
        let (_dir, db) = test_db().await;
        let id = create_user(db.pool(), &new_user("alice")).await.unwrap();
        let user = get_user(db.pool(), id).await.unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.role, Role::User);
        assert!(user.is_active);

        let err = create_user(db.pool(), &new_user("alice")).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_leaves_nothing() {
        let (_dir, db) = test_db().await;
        {
            let mut tx = db.begin().await.unwrap();
            create_user(&mut *tx, &new_user("alice")).await.unwrap();
            tx.rollback().await.unwrap();
        }
        assert!(find_user_by_username(db.pool(), "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_package_assignment() {
        let (_dir, db) = test_db().await;
        let user_id = create_user(db.pool(), &new_user("alice")).await.unwrap();
        let package_id = create_package(db.pool(), &starter()).await.unwrap();
        assign_package(db.pool(), user_id, package_id).await.unwrap();

        let package = package_for_user(db.pool(), user_id).await.unwrap().unwrap();
        assert_eq!(package.name, "Starter");
        assert_eq!(package.mail_hourly_limit, 2);
        assert!(matches!(
            assign_package(db.pool(), user_id, package_id).await,
            Err(DbError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_user_tree_removes_children() {
        let (_dir, db) = test_db().await;
        let user_id = create_user(db.pool(), &new_user("alice")).await.unwrap();
        let package_id = create_package(db.pool(), &starter()).await.unwrap();
        assign_package(db.pool(), user_id, package_id).await.unwrap();
        let domain_id = create_domain(
            db.pool(),
            &NewDomain {
                user_id,
                name: "alice.example",
                document_root: "/home/alice/public_html",
                php_version: "8.2",
            },
        )
        .await
        .unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        insert_dns_records(
            &mut conn,
            domain_id,
            &[NewDnsRecord {
                name: "@".to_string(),
                record_type: "A".to_string(),
                content: "203.0.113.10".to_string(),
                ttl: 3600,
                priority: None,
            }],
        )
        .await
        .unwrap();

        let mut tx = db.begin().await.unwrap();
        delete_user_tree(&mut tx, user_id).await.unwrap();
        tx.commit().await.unwrap();

        assert!(matches!(get_user(db.pool(), user_id).await, Err(DbError::NotFound(_))));
        assert!(find_domain_by_name(db.pool(), "alice.example").await.unwrap().is_none());
        assert!(dns_records_for_domain(db.pool(), domain_id).await.unwrap().is_empty());
        // The package itself survives its assignment.
        assert!(get_package(db.pool(), package_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_mail_queue_ordering_and_claim() {
        let (_dir, db) = test_db().await;
        let user_id = create_user(db.pool(), &new_user("alice")).await.unwrap();
        let now = Utc::now();
        let mail = |priority, scheduled_at| NewMail {
            user_id,
            sender: "alice@alice.example",
            recipient: "bob@example.com",
            subject: "Hi",
            body: "Hello",
            headers: "[]",
            priority,
            max_retries: 3,
            scheduled_at,
        };

        let low = enqueue_mail(db.pool(), &mail(9, now - Duration::minutes(5))).await.unwrap();
        let high = enqueue_mail(db.pool(), &mail(1, now - Duration::minutes(1))).await.unwrap();
        let future = enqueue_mail(db.pool(), &mail(1, now + Duration::hours(1))).await.unwrap();

        let due = due_mail(db.pool(), now, 10).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![high, low]);
        assert!(!ids.contains(&future));

        assert!(claim_mail(db.pool(), high).await.unwrap());
        assert!(!claim_mail(db.pool(), high).await.unwrap());
        assert_eq!(get_mail(db.pool(), high).await.unwrap().state, MailState::Processing);

        fail_mail(db.pool(), high, 3, "550 rejected").await.unwrap();
        let failed = get_mail(db.pool(), high).await.unwrap();
        assert_eq!(failed.state, MailState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("550 rejected"));
    }

    #[tokio::test]
    async fn test_release_stale_mail_counts_the_attempt() {
        let (_dir, db) = test_db().await;
        let user_id = create_user(db.pool(), &new_user("alice")).await.unwrap();
        let mail = |max_retries| NewMail {
            user_id,
            sender: "alice@alice.example",
            recipient: "bob@example.com",
            subject: "Hi",
            body: "Hello",
            headers: "[]",
            priority: 5,
            max_retries,
            scheduled_at: Utc::now(),
        };
        let retryable = enqueue_mail(db.pool(), &mail(3)).await.unwrap();
        let last_chance = enqueue_mail(db.pool(), &mail(1)).await.unwrap();
        let untouched = enqueue_mail(db.pool(), &mail(3)).await.unwrap();
        assert!(claim_mail(db.pool(), retryable).await.unwrap());
        assert!(claim_mail(db.pool(), last_chance).await.unwrap());

        // Claimed just now, so an older cutoff releases nothing.
        let released = release_stale_mail(db.pool(), Utc::now() - Duration::minutes(10)).await.unwrap();
        assert_eq!(released, 0);

        let released = release_stale_mail(db.pool(), Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(released, 2);

        let item = get_mail(db.pool(), retryable).await.unwrap();
        assert_eq!(item.state, MailState::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("Delivery interrupted"));

        let item = get_mail(db.pool(), last_chance).await.unwrap();
        assert_eq!(item.state, MailState::Failed);
        assert_eq!(item.retry_count, 1);

        let item = get_mail(db.pool(), untouched).await.unwrap();
        assert_eq!(item.state, MailState::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn test_send_log_window() {
        let (_dir, db) = test_db().await;
        let user_id = create_user(db.pool(), &new_user("alice")).await.unwrap();
        let now = Utc::now();
        record_send(db.pool(), user_id, "a@example.com", now - Duration::hours(2)).await.unwrap();
        record_send(db.pool(), user_id, "b@example.com", now - Duration::minutes(10)).await.unwrap();

        assert_eq!(count_sends_since(db.pool(), user_id, now - Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(count_sends_since(db.pool(), user_id, now - Duration::days(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_settings_upsert_and_activity() {
        let (_dir, db) = test_db().await;
        assert_eq!(get_setting(db.pool(), "web_server").await.unwrap(), None);
        set_setting(db.pool(), "web_server", "apache").await.unwrap();
        set_setting(db.pool(), "web_server", "nginx").await.unwrap();
        assert_eq!(get_setting(db.pool(), "web_server").await.unwrap().as_deref(), Some("nginx"));

        log_activity(db.pool(), None, "account.create", "alice", Some("alice.example"))
            .await
            .unwrap();
        let recent = recent_activity(db.pool(), 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].action, "account.create");
    }
}
