//! Package installs that run as streamed background tasks.

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use hp_actors::tasks::{new_task_id, spawn_command_task, TaskError, TaskRegistry, TaskSnapshot};
use hp_core::install::{InstallAction, InstallError, InstallKind, InstallRequest};
use hp_core::php::packages::SUPPORTED_VERSIONS;
use hp_core::php::PoolError;

use crate::context::{Actor, HostContext};
use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum InstallServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("Access denied")]
    Forbidden,
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl InstallServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::Task(TaskError::NotFound(_)) => ErrorKind::NotFound,
            Self::Task(TaskError::Duplicate(_)) => ErrorKind::Conflict,
            Self::Pool(_) => ErrorKind::Internal,
        }
    }
}

impl From<InstallError> for InstallServiceError {
    fn from(e: InstallError) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Returned as soon as the task is registered; progress goes over the
/// task stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStarted {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhpVersions {
    pub installed: Vec<String>,
    pub supported: Vec<String>,
    pub default: String,
}

#[derive(Clone)]
pub struct InstallService {
    registry: TaskRegistry,
    host: HostContext,
}

impl InstallService {
    pub fn new(registry: TaskRegistry, host: HostContext) -> Self {
        Self { registry, host }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    fn require_admin(actor: &Actor) -> Result<(), InstallServiceError> {
        if actor.is_admin() {
            Ok(())
        } else {
            Err(InstallServiceError::Forbidden)
        }
    }

    /// Plan `request`, register a task for it and start the plan in the
    /// background. Not cancellable once started.
    pub fn start(&self, actor: &Actor, request: &InstallRequest) -> Result<TaskStarted, InstallServiceError> {
        Self::require_admin(actor)?;
        let plan = request.plan()?;

        let task_id = new_task_id();
        self.registry.create(&task_id, &plan.task_type, &plan.name)?;
        // Detached: the handler answers with the id while the task runs.
        let _handle = spawn_command_task(
            self.registry.clone(),
            self.host.runner.clone(),
            task_id.clone(),
            plan.steps,
        );
        info!(
            task_id = %task_id,
            task_type = %plan.task_type,
            actor = %actor.username,
            "Install task started"
        );
        Ok(TaskStarted {
            task_id,
            task_type: plan.task_type,
            name: plan.name,
        })
    }

    pub fn php_versions(&self) -> Result<PhpVersions, InstallServiceError> {
        Ok(PhpVersions {
            installed: self.host.php.installed_versions()?,
            supported: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            default: self.host.settings.php_default_version.clone(),
        })
    }

    pub fn install_php(&self, actor: &Actor, version: &str) -> Result<TaskStarted, InstallServiceError> {
        self.start(
            actor,
            &InstallRequest {
                kind: InstallKind::Php,
                action: InstallAction::Install,
                target: version.to_string(),
            },
        )
    }

    /// The panel's default version backs every new pool, so it stays.
    pub fn uninstall_php(&self, actor: &Actor, version: &str) -> Result<TaskStarted, InstallServiceError> {
        Self::require_admin(actor)?;
        if version == self.host.settings.php_default_version {
            return Err(InstallServiceError::Validation(format!(
                "PHP {} is the default version and cannot be removed",
                version
            )));
        }
        self.start(
            actor,
            &InstallRequest {
                kind: InstallKind::Php,
                action: InstallAction::Uninstall,
                target: version.to_string(),
            },
        )
    }

    pub fn task(&self, actor: &Actor, id: &str) -> Result<TaskSnapshot, InstallServiceError> {
        Self::require_admin(actor)?;
        self.registry
            .get(id)
            .ok_or_else(|| InstallServiceError::Task(TaskError::NotFound(id.to_string())))
    }
}
