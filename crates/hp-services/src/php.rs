//! Domain-level PHP settings.

use thiserror::Error;
use tracing::{info, warn};

use hp_core::php::limits::LimitError;
use hp_core::php::{IniOverrides, PhpLimits, PoolError};
use hp_db::models::{Domain, Package};
use hp_db::{queries, Database, DbError};

use crate::context::{Actor, HostContext};
use crate::error::{db_kind, ErrorKind};

#[derive(Debug, Error)]
pub enum PhpSettingsError {
    #[error("{0}")]
    Validation(String),
    #[error("Access denied")]
    Forbidden,
    #[error("Account is suspended: {0}")]
    Suspended(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl PhpSettingsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Forbidden | Self::Suspended(_) => ErrorKind::Forbidden,
            Self::Pool(PoolError::Validation(_) | PoolError::Limits(_)) => ErrorKind::Validation,
            Self::Pool(_) => ErrorKind::Internal,
            Self::Database(e) => db_kind(e),
        }
    }
}

impl From<LimitError> for PhpSettingsError {
    fn from(e: LimitError) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Caps a package puts on PHP settings.
pub fn package_limits(package: &Package) -> PhpLimits {
    PhpLimits {
        memory_limit: package.max_php_memory.clone(),
        upload_max_filesize: package.max_php_upload.clone(),
        max_execution_time: u32::try_from(package.max_php_execution_time.max(0)).unwrap_or(u32::MAX),
    }
}

/// Overrides stored for a domain. Unreadable JSON counts as no overrides.
pub fn stored_overrides(domain: &Domain) -> IniOverrides {
    match serde_json::from_str(&domain.php_ini) {
        Ok(overrides) => overrides,
        Err(e) => {
            warn!(domain = %domain.name, error = %e, "Ignoring unreadable stored PHP settings");
            IniOverrides::default()
        }
    }
}

#[derive(Clone)]
pub struct PhpSettingsService {
    db: Database,
    host: HostContext,
}

impl PhpSettingsService {
    pub fn new(db: Database, host: HostContext) -> Self {
        Self { db, host }
    }

    /// Merge `changes` into the domain's overrides and rewrite the owner's
    /// pool. Values above the owner's package caps are lowered to the cap
    /// unless an admin is asking. Returns what was written.
    pub async fn update_domain_ini(
        &self,
        actor: &Actor,
        domain_id: i64,
        changes: &IniOverrides,
    ) -> Result<IniOverrides, PhpSettingsError> {
        changes.validate()?;

        let pool = self.db.pool();
        let domain = match queries::get_domain(pool, domain_id).await {
            Ok(domain) => domain,
            Err(DbError::NotFound(_)) if !actor.is_admin() => return Err(PhpSettingsError::Forbidden),
            Err(e) => return Err(e.into()),
        };
        let owner = queries::get_user(pool, domain.user_id).await?;
        if !actor.can_manage(&owner) {
            return Err(PhpSettingsError::Forbidden);
        }
        if !owner.is_active {
            return Err(PhpSettingsError::Suspended(owner.username));
        }

        let merged = stored_overrides(&domain).merge(changes);
        let effective = if actor.is_admin() {
            merged
        } else {
            let limits = queries::package_for_user(pool, owner.id)
                .await?
                .map(|p| package_limits(&p))
                .unwrap_or_default();
            let clamped = merged.clamp(&limits);
            if clamped != merged {
                info!(domain = %domain.name, "PHP settings clamped to package limits");
            }
            clamped
        };

        self.host
            .php
            .update_overrides(&owner.username, &domain.php_version, &effective)
            .await?;

        let json = serde_json::to_string(&effective)
            .map_err(|e| PhpSettingsError::Validation(e.to_string()))?;
        queries::set_domain_php_ini(pool, domain.id, &json).await?;
        queries::log_activity(pool, Some(actor.id), "domain.php", &domain.name, Some(&json)).await?;

        info!(domain = %domain.name, version = %domain.php_version, "PHP settings updated");
        Ok(effective)
    }
}
