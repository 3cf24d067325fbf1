use std::path::PathBuf;

use super::limits::IniOverrides;
use crate::web::user_fpm_socket;

/// Group owning every per-user FPM socket, the web server's group on Debian.
pub const DEFAULT_LISTEN_GROUP: &str = "www-data";

/// Process-manager sizing applied to every user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessManager {
    pub max_children: u32,
    pub start_servers: u32,
    pub min_spare_servers: u32,
    pub max_spare_servers: u32,
    pub max_requests: u32,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self {
            max_children: 5,
            start_servers: 2,
            min_spare_servers: 1,
            max_spare_servers: 3,
            max_requests: 500,
        }
    }
}

/// One user's pool for one PHP version.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub username: String,
    pub php_version: String,
    /// Logical home directory; bounds `open_basedir`.
    pub home: PathBuf,
    pub listen_group: String,
    pub process_manager: ProcessManager,
    pub overrides: IniOverrides,
}

impl PoolConfig {
    pub fn new(username: &str, php_version: &str, home: PathBuf) -> Self {
        Self {
            username: username.to_string(),
            php_version: php_version.to_string(),
            home,
            listen_group: DEFAULT_LISTEN_GROUP.to_string(),
            process_manager: ProcessManager::default(),
            overrides: IniOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: IniOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn socket(&self) -> String {
        user_fpm_socket(&self.php_version, &self.username)
    }

    pub fn render(&self) -> String {
        let home = self.home.display();
        let pm = &self.process_manager;
        let mut out = format!(
            "\
; PHP-FPM pool for {user} (PHP {version}), managed by hostpanel
[{user}]
user = {user}
group = {user}
listen = {socket}
listen.owner = {group}
listen.group = {group}
listen.mode = 0660

pm = dynamic
pm.max_children = {max_children}
pm.start_servers = {start_servers}
pm.min_spare_servers = {min_spare}
pm.max_spare_servers = {max_spare}
pm.max_requests = {max_requests}

php_admin_value[open_basedir] = {home}:/tmp:/usr/share/php
php_admin_value[upload_tmp_dir] = {home}/tmp
php_admin_value[session.save_path] = {home}/tmp
",
            user = self.username,
            version = self.php_version,
            socket = self.socket(),
            group = self.listen_group,
            max_children = pm.max_children,
            start_servers = pm.start_servers,
            min_spare = pm.min_spare_servers,
            max_spare = pm.max_spare_servers,
            max_requests = pm.max_requests,
            home = home,
        );
        for (key, value) in self.overrides.directives() {
            out.push_str(&format!("{} = {}\n", key, value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::php::parser::parse_pool;

    fn alice() -> PoolConfig {
        PoolConfig::new("alice", "8.2", PathBuf::from("/home/alice"))
    }

    #[test]
    fn test_render_identity_and_socket() {
        let out = alice().render();
        assert!(out.contains("[alice]\n"));
        assert!(out.contains("user = alice\ngroup = alice\n"));
        assert!(out.contains("listen = /run/php/php8.2-fpm-alice.sock\n"));
        assert!(out.contains("listen.group = www-data\n"));
        assert!(out.contains("listen.mode = 0660\n"));
        assert!(out.contains("pm = dynamic\n"));
    }

    #[test]
    fn test_open_basedir_is_confined() {
        let pool = parse_pool(&alice().render()).unwrap();
        assert_eq!(
            pool.get("php_admin_value[open_basedir]"),
            Some("/home/alice:/tmp:/usr/share/php")
        );
    }

    #[test]
    fn test_overrides_are_appended() {
        let config = alice().with_overrides(IniOverrides {
            memory_limit: Some("256M".to_string()),
            display_errors: Some(false),
            ..Default::default()
        });
        let pool = parse_pool(&config.render()).unwrap();
        assert_eq!(pool.get("php_admin_value[memory_limit]"), Some("256M"));
        assert_eq!(pool.get("php_admin_flag[display_errors]"), Some("off"));
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(alice().render(), alice().render());
    }
}
