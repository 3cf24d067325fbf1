//! Install and uninstall plans for PHP builds and server components.
//!
//! A plan is an ordered list of commands plus a human-readable name; the
//! task runner streams it. Only whitelisted targets produce a plan.

pub mod packages;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::CommandSpec;
use crate::php::packages::{install_plan as php_install_plan, uninstall_plan as php_uninstall_plan};
use crate::security::input::ValidationError;

pub use packages::{Component, ALL_COMPONENTS};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    UnknownTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallKind {
    Php,
    Component,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallAction {
    Install,
    Uninstall,
}

/// Body of an install request, e.g. `{"type":"php","action":"install","target":"8.2"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    #[serde(rename = "type")]
    pub kind: InstallKind,
    pub action: InstallAction,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct InstallPlan {
    /// Task type tag, e.g. `php-install`.
    pub task_type: String,
    pub name: String,
    pub steps: Vec<CommandSpec>,
}

fn component_install(component: Component) -> Vec<CommandSpec> {
    let mut steps = vec![
        CommandSpec::new("apt-get").arg("update").noninteractive(),
        CommandSpec::new("apt-get")
            .args(["install", "-y", "--no-install-recommends"])
            .args(component.packages().iter().copied())
            .noninteractive(),
    ];
    for unit in component.units() {
        steps.push(CommandSpec::new("systemctl").args(["enable", "--now", *unit]));
    }
    steps
}

fn component_uninstall(component: Component) -> Vec<CommandSpec> {
    let mut steps: Vec<CommandSpec> = component
        .units()
        .iter()
        .map(|unit| CommandSpec::new("systemctl").args(["disable", "--now", *unit]))
        .collect();
    steps.push(
        CommandSpec::new("apt-get")
            .args(["purge", "-y"])
            .args(component.packages().iter().copied())
            .noninteractive(),
    );
    steps.push(
        CommandSpec::new("apt-get")
            .args(["autoremove", "-y"])
            .noninteractive(),
    );
    steps
}

impl InstallRequest {
    pub fn plan(&self) -> Result<InstallPlan, InstallError> {
        let verb = match self.action {
            InstallAction::Install => "install",
            InstallAction::Uninstall => "uninstall",
        };
        match self.kind {
            InstallKind::Php => {
                let steps = match self.action {
                    InstallAction::Install => php_install_plan(&self.target)?,
                    InstallAction::Uninstall => php_uninstall_plan(&self.target)?,
                };
                Ok(InstallPlan {
                    task_type: format!("php-{}", verb),
                    name: format!("{} PHP {}", capitalize(verb), self.target),
                    steps,
                })
            }
            InstallKind::Component => {
                let component: Component = self.target.parse().map_err(InstallError::UnknownTarget)?;
                let steps = match self.action {
                    InstallAction::Install => component_install(component),
                    InstallAction::Uninstall => component_uninstall(component),
                };
                Ok(InstallPlan {
                    task_type: format!("component-{}", verb),
                    name: format!("{} {}", capitalize(verb), component),
                    steps,
                })
            }
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: InstallKind, action: InstallAction, target: &str) -> InstallRequest {
        InstallRequest {
            kind,
            action,
            target: target.to_string(),
        }
    }

    #[test]
    fn test_request_deserializes() {
        let req: InstallRequest =
            serde_json::from_str(r#"{"type":"php","action":"install","target":"8.2"}"#).unwrap();
        assert_eq!(req, request(InstallKind::Php, InstallAction::Install, "8.2"));
    }

    #[test]
    fn test_php_plan() {
        let plan = request(InstallKind::Php, InstallAction::Install, "8.2").plan().unwrap();
        assert_eq!(plan.task_type, "php-install");
        assert_eq!(plan.name, "Install PHP 8.2");
        assert_eq!(plan.steps.len(), 3);
    }

    #[test]
    fn test_component_plan() {
        let plan = request(InstallKind::Component, InstallAction::Install, "mail")
            .plan()
            .unwrap();
        assert_eq!(plan.name, "Install mail");
        let displays: Vec<String> = plan.steps.iter().map(|s| s.display()).collect();
        assert_eq!(displays[0], "apt-get update");
        assert!(displays[1].starts_with("apt-get install -y --no-install-recommends postfix"));
        assert_eq!(displays[2], "systemctl enable --now postfix");
        assert_eq!(displays.last().unwrap(), "systemctl enable --now opendkim");
    }

    #[test]
    fn test_unknown_targets_rejected() {
        assert!(request(InstallKind::Component, InstallAction::Install, "sendmail; rm -rf /")
            .plan()
            .is_err());
        assert!(request(InstallKind::Php, InstallAction::Install, "5.6").plan().is_err());
        assert!(request(InstallKind::Php, InstallAction::Install, "8.2 && id").plan().is_err());
    }

    #[test]
    fn test_component_uninstall_stops_units_first() {
        let plan = request(InstallKind::Component, InstallAction::Uninstall, "database")
            .plan()
            .unwrap();
        assert_eq!(plan.steps[0].display(), "systemctl disable --now mariadb");
        assert_eq!(plan.steps.last().unwrap().display(), "apt-get autoremove -y");
    }
}
