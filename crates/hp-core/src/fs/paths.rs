//! Logical host layout and its mapping onto the real filesystem.
//!
//! Components reason in logical paths (`/etc/postfix/vdomains`,
//! `/home/alice/public_html`) and render those into config content. Every
//! filesystem operation goes through [`HostPaths::resolve`], which in simulate
//! mode rebases the logical path under a sandbox directory.

use std::path::{Path, PathBuf};

pub const DEFAULT_HOME_BASE: &str = "/home";
pub const DEFAULT_ZONES_DIR: &str = "/etc/bind/zones";

/// Directories materialised under every account home.
pub const HOME_SUBDIRS: &[&str] = &["public_html", "logs", "tmp", "mail", "ssl"];

#[derive(Debug, Clone)]
pub struct HostPaths {
    root: PathBuf,
    home_base: PathBuf,
    zones_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::system()
    }
}

impl HostPaths {
    /// The live host: logical paths are real paths.
    pub fn system() -> Self {
        Self {
            root: PathBuf::from("/"),
            home_base: PathBuf::from(DEFAULT_HOME_BASE),
            zones_dir: PathBuf::from(DEFAULT_ZONES_DIR),
        }
    }

    /// Sandbox rooted at `root`, used by simulate mode and tests.
    pub fn rebased(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::system()
        }
    }

    pub fn with_home_base(mut self, home_base: impl Into<PathBuf>) -> Self {
        self.home_base = home_base.into();
        self
    }

    pub fn with_zones_dir(mut self, zones_dir: impl Into<PathBuf>) -> Self {
        self.zones_dir = zones_dir.into();
        self
    }

    pub fn is_rebased(&self) -> bool {
        self.root != Path::new("/")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a logical path onto the filesystem.
    pub fn resolve(&self, logical: impl AsRef<Path>) -> PathBuf {
        let logical = logical.as_ref();
        if !self.is_rebased() {
            return logical.to_path_buf();
        }
        match logical.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.join(logical),
        }
    }

    pub fn home_base(&self) -> &Path {
        &self.home_base
    }

    pub fn zones_dir(&self) -> &Path {
        &self.zones_dir
    }

    /// Logical home directory of an account.
    pub fn home(&self, username: &str) -> PathBuf {
        self.home_base.join(username)
    }

    pub fn public_html(&self, username: &str) -> PathBuf {
        self.home(username).join("public_html")
    }

    pub fn logs_dir(&self, username: &str) -> PathBuf {
        self.home(username).join("logs")
    }
}

/// Render a logical path for config content.
pub fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_paths_are_identity() {
        let paths = HostPaths::system();
        assert!(!paths.is_rebased());
        assert_eq!(
            paths.resolve("/etc/postfix/vdomains"),
            PathBuf::from("/etc/postfix/vdomains")
        );
    }

    #[test]
    fn test_rebased_paths() {
        let paths = HostPaths::rebased("/tmp/sandbox");
        assert!(paths.is_rebased());
        assert_eq!(
            paths.resolve("/etc/postfix/vdomains"),
            PathBuf::from("/tmp/sandbox/etc/postfix/vdomains")
        );
        assert_eq!(
            paths.resolve(paths.public_html("alice")),
            PathBuf::from("/tmp/sandbox/home/alice/public_html")
        );
    }

    #[test]
    fn test_custom_home_base() {
        let paths = HostPaths::system().with_home_base("/srv/users");
        assert_eq!(paths.home("bob"), PathBuf::from("/srv/users/bob"));
        assert_eq!(paths.logs_dir("bob"), PathBuf::from("/srv/users/bob/logs"));
    }
}
