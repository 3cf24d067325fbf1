use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("Failed to set permissions on {path}: {source}")]
    SetPermissions { path: String, source: io::Error },
    #[error("Failed to set ownership on {path}: {source}")]
    SetOwnership { path: String, source: nix::Error },
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Numeric owner for chown calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Uid,
    pub gid: Gid,
}

impl Ownership {
    /// Owner and primary group of a POSIX user.
    pub fn of_user(username: &str) -> Result<Self, PermissionError> {
        let user = nix::unistd::User::from_name(username)
            .map_err(|_| PermissionError::UserNotFound(username.to_string()))?
            .ok_or_else(|| PermissionError::UserNotFound(username.to_string()))?;
        Ok(Self {
            uid: user.uid,
            gid: user.gid,
        })
    }

    /// Named user and named group, e.g. `opendkim:opendkim`.
    pub fn of(owner: &str, group: &str) -> Result<Self, PermissionError> {
        let uid = nix::unistd::User::from_name(owner)
            .map_err(|_| PermissionError::UserNotFound(owner.to_string()))?
            .map(|u| u.uid)
            .ok_or_else(|| PermissionError::UserNotFound(owner.to_string()))?;
        let gid = nix::unistd::Group::from_name(group)
            .map_err(|_| PermissionError::GroupNotFound(group.to_string()))?
            .map(|g| g.gid)
            .ok_or_else(|| PermissionError::GroupNotFound(group.to_string()))?;
        Ok(Self { uid, gid })
    }
}

/// Mode for one directory of an account home.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRule {
    pub path: PathBuf,
    pub mode: u32,
}

/// Modes for a freshly materialised account home.
///
/// The home is traversable but not listable so the web server can reach
/// `public_html` while peers cannot enumerate siblings.
pub fn account_manifest(home: &Path) -> Vec<PermissionRule> {
    vec![
        PermissionRule {
            path: home.to_path_buf(),
            mode: 0o711,
        },
        PermissionRule {
            path: home.join("public_html"),
            mode: 0o755,
        },
        PermissionRule {
            path: home.join("logs"),
            mode: 0o750,
        },
        PermissionRule {
            path: home.join("tmp"),
            mode: 0o700,
        },
        PermissionRule {
            path: home.join("mail"),
            mode: 0o700,
        },
        PermissionRule {
            path: home.join("ssl"),
            mode: 0o700,
        },
    ]
}

pub fn set_mode(path: &Path, mode: u32) -> Result<(), PermissionError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        PermissionError::SetPermissions {
            path: path.display().to_string(),
            source: e,
        }
    })
}

/// Apply each rule whose path exists; missing paths are skipped with a warning.
pub fn apply_rules(rules: &[PermissionRule]) -> Result<(), PermissionError> {
    for rule in rules {
        if !rule.path.exists() {
            warn!(path = %rule.path.display(), "Path does not exist, skipping");
            continue;
        }
        set_mode(&rule.path, rule.mode)?;
        debug!(path = %rule.path.display(), mode = format!("{:o}", rule.mode), "Applied mode");
    }
    Ok(())
}

pub fn chown_path(path: &Path, owner: Ownership) -> Result<(), PermissionError> {
    chown(path, Some(owner.uid), Some(owner.gid)).map_err(|e| PermissionError::SetOwnership {
        path: path.display().to_string(),
        source: e,
    })
}

/// Recursively chown a tree without following symlinks out of it.
pub fn chown_tree(path: &Path, owner: Ownership) -> Result<(), PermissionError> {
    chown_path(path, owner)?;
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry.file_type()?.is_symlink() {
                continue;
            }
            chown_tree(&entry_path, owner)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_account_manifest_modes() {
        let manifest = account_manifest(Path::new("/home/alice"));
        let mode_of = |p: &str| {
            manifest
                .iter()
                .find(|r| r.path == Path::new(p))
                .map(|r| r.mode)
        };
        assert_eq!(mode_of("/home/alice"), Some(0o711));
        assert_eq!(mode_of("/home/alice/public_html"), Some(0o755));
        assert_eq!(mode_of("/home/alice/ssl"), Some(0o700));
    }

    #[test]
    fn test_apply_rules_sets_modes_and_skips_missing() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("alice");
        fs::create_dir_all(home.join("public_html")).unwrap();

        apply_rules(&account_manifest(&home)).unwrap();

        let home_mode = fs::metadata(&home).unwrap().permissions().mode() & 0o777;
        let html_mode = fs::metadata(home.join("public_html"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(home_mode, 0o711);
        assert_eq!(html_mode, 0o755);
    }

    #[test]
    fn test_unknown_user_is_reported() {
        let err = Ownership::of_user("hostpanel-no-such-user").unwrap_err();
        assert!(matches!(err, PermissionError::UserNotFound(_)));
    }
}
