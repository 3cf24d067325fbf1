//! Tenant databases and users in the local MariaDB/MySQL server.
//!
//! Every identifier is `<owner>_<name>` (see
//! [`namespaced_identifier`](crate::security::input::namespaced_identifier)),
//! so an account's objects can be found and dropped by prefix.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::exec::{CommandRunner, CommandSpec, RunnerError};
use crate::security::input::{validate_account_username, ValidationError};

#[derive(Debug, Error)]
pub enum MysqlError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Command(#[from] RunnerError),
}

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").unwrap());
static HOST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.%:-]{1,255}$").unwrap());

/// What `drop_account_objects` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MysqlCleanup {
    pub databases: Vec<String>,
    pub users: Vec<String>,
}

/// Administrative statements run through the `mysql` client as root over
/// the local socket.
#[derive(Debug, Clone)]
pub struct MysqlAdmin {
    runner: CommandRunner,
}

impl MysqlAdmin {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    async fn query(&self, sql: &str) -> Result<Vec<String>, MysqlError> {
        let spec = CommandSpec::new("mysql")
            .args(["--batch", "--skip-column-names", "-e"])
            .arg(sql);
        let output = self.runner.run_checked(&spec).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Databases named `<owner>_%`.
    pub async fn account_databases(&self, owner: &str) -> Result<Vec<String>, MysqlError> {
        validate_account_username(owner)?;
        let rows = self
            .query(&format!("SHOW DATABASES LIKE '{}\\_%'", owner))
            .await?;
        Ok(rows
            .into_iter()
            .filter(|name| IDENTIFIER_RE.is_match(name))
            .collect())
    }

    /// `(user, host)` pairs for users named `<owner>_%`.
    pub async fn account_users(&self, owner: &str) -> Result<Vec<(String, String)>, MysqlError> {
        validate_account_username(owner)?;
        let rows = self
            .query(&format!(
                "SELECT User, Host FROM mysql.user WHERE User LIKE '{}\\_%'",
                owner
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let (user, host) = row.split_once('\t')?;
                (IDENTIFIER_RE.is_match(user) && HOST_RE.is_match(host))
                    .then(|| (user.to_string(), host.to_string()))
            })
            .collect())
    }

    /// Drop every database and user belonging to `owner`. One failing drop
    /// does not stop the others; failures are logged and skipped.
    pub async fn drop_account_objects(&self, owner: &str) -> Result<MysqlCleanup, MysqlError> {
        let mut cleanup = MysqlCleanup::default();

        for database in self.account_databases(owner).await? {
            match self.query(&format!("DROP DATABASE IF EXISTS `{}`", database)).await {
                Ok(_) => cleanup.databases.push(database),
                Err(e) => warn!(owner, database = %database, error = %e, "Failed to drop database"),
            }
        }

        for (user, host) in self.account_users(owner).await? {
            match self
                .query(&format!("DROP USER IF EXISTS '{}'@'{}'", user, host))
                .await
            {
                Ok(_) => cleanup.users.push(format!("{}@{}", user, host)),
                Err(e) => warn!(owner, user = %user, error = %e, "Failed to drop database user"),
            }
        }

        if !cleanup.databases.is_empty() || !cleanup.users.is_empty() {
            self.query("FLUSH PRIVILEGES").await?;
        }

        info!(
            owner,
            databases = cleanup.databases.len(),
            users = cleanup.users.len(),
            "Dropped account database objects"
        );
        Ok(cleanup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_cleanup_queries_by_prefix() {
        let runner = CommandRunner::simulated();
        let admin = MysqlAdmin::new(runner.clone());
        let cleanup = admin.drop_account_objects("alice").await.unwrap();

        assert_eq!(cleanup, MysqlCleanup::default());
        assert_eq!(
            runner.journal(),
            vec![
                "mysql --batch --skip-column-names -e SHOW DATABASES LIKE 'alice\\_%'",
                "mysql --batch --skip-column-names -e SELECT User, Host FROM mysql.user WHERE User LIKE 'alice\\_%'",
            ]
        );
    }

    #[tokio::test]
    async fn test_owner_is_validated() {
        let admin = MysqlAdmin::new(CommandRunner::simulated());
        assert!(admin.drop_account_objects("x' OR '1'='1").await.is_err());
    }
}
