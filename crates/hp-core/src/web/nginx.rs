use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::PathBuf;

use tracing::debug;

use super::{SiteTree, VhostError, VhostHandler, VhostSpec};
use crate::exec::CommandRunner;
use crate::fs::HostPaths;

/// Nginx with `sites-enabled` symlinks maintained by the panel. There is no
/// `.htaccess` equivalent, so per-directory overrides are not honoured.
#[derive(Debug, Clone)]
pub struct NginxDriver {
    pub(crate) tree: SiteTree,
}

impl NginxDriver {
    pub fn new(runner: CommandRunner, paths: HostPaths) -> Self {
        Self {
            tree: SiteTree::new(runner, paths, "/etc/nginx", "nginx"),
        }
    }

    /// Link `sites-enabled/<site>.conf` to `../sites-available/<site>.conf`.
    /// The relative target keeps the link valid inside a rebased tree.
    pub(crate) fn enable(&self, site: &str) -> Result<(), VhostError> {
        let link = self.tree.resolve(&self.tree.enabled(site));
        if fs::symlink_metadata(&link).is_ok() {
            return Ok(());
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        let target = PathBuf::from("../sites-available").join(format!("{}.conf", site));
        symlink(&target, &link)?;
        debug!(site, "Enabled nginx site");
        Ok(())
    }

    pub(crate) fn disable(&self, site: &str) -> Result<(), VhostError> {
        let link = self.tree.resolve(&self.tree.enabled(site));
        match fs::remove_file(&link) {
            Ok(()) => {
                debug!(site, "Disabled nginx site");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Render a `server { }` block.
pub fn render(spec: &VhostSpec) -> String {
    let mut names = vec![spec.server_name.as_str()];
    names.extend(spec.aliases.iter().map(String::as_str));
    let document_root = spec.document_root.display();
    let mut out = String::new();

    out.push_str("server {\n");
    match spec.tls {
        Some(_) => out.push_str("    listen 443 ssl;\n    listen [::]:443 ssl;\n"),
        None => out.push_str("    listen 80;\n    listen [::]:80;\n"),
    }
    out.push_str(&format!("    server_name {};\n", names.join(" ")));
    out.push_str(&format!("    root {};\n", document_root));
    out.push_str("    index index.php index.html index.htm;\n");

    out.push_str(&format!(
        "\n    access_log {};\n    error_log {};\n",
        spec.log_path("access"),
        spec.log_path("error"),
    ));

    if let Some(tls) = &spec.tls {
        out.push_str(&format!(
            "\
\n    ssl_certificate {cert};
    ssl_certificate_key {key};
    ssl_protocols TLSv1.2 TLSv1.3;
    add_header Strict-Transport-Security \"max-age=31536000\" always;
",
            cert = tls.certificate,
            key = tls.key,
        ));
    }

    for alias in &spec.path_aliases {
        out.push_str(&format!(
            "\n    location ^~ {url} {{\n        alias {dir};\n    }}\n",
            url = alias.url_path,
            dir = alias.directory,
        ));
    }

    match &spec.handler {
        VhostHandler::Php { socket } => {
            out.push_str(
                "\
\n    location / {
        autoindex off;
        try_files $uri $uri/ /index.php?$query_string;
    }
",
            );
            out.push_str(&format!(
                "\
\n    location ~ \\.php$ {{
        include snippets/fastcgi-php.conf;
        fastcgi_pass unix:{socket};
    }}
",
            ));
        }
        VhostHandler::Proxy { port } => {
            out.push_str(&format!(
                "\
\n    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection \"upgrade\";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
",
            ));
        }
    }

    out.push_str("\n    location ~ /\\.ht {\n        deny all;\n    }\n");
    out.push_str("}\n");
    out
}
