use tracing::debug;

use super::{SiteTree, VhostError, VhostHandler, VhostSpec};
use crate::exec::{CommandRunner, CommandSpec};
use crate::fs::HostPaths;

/// Apache 2.4 with `a2ensite`/`a2dissite` managing `sites-enabled`.
#[derive(Debug, Clone)]
pub struct ApacheDriver {
    pub(crate) tree: SiteTree,
}

impl ApacheDriver {
    pub fn new(runner: CommandRunner, paths: HostPaths) -> Self {
        Self {
            tree: SiteTree::new(runner, paths, "/etc/apache2", "apache2"),
        }
    }

    pub(crate) async fn enable(&self, site: &str) -> Result<(), VhostError> {
        let spec = CommandSpec::new("a2ensite").arg(site);
        self.tree.runner.run_checked(&spec).await?;
        Ok(())
    }

    /// `a2dissite` exits non-zero for a site that is not enabled, which is
    /// the state we want anyway.
    pub(crate) async fn disable(&self, site: &str) -> Result<(), VhostError> {
        let spec = CommandSpec::new("a2dissite").arg(site);
        let output = self.tree.runner.run(&spec).await?;
        if !output.success() {
            debug!(site, output = %output.combined(), "Site was not enabled");
        }
        Ok(())
    }
}

/// Render a `<VirtualHost>` block.
pub fn render(spec: &VhostSpec) -> String {
    let port = if spec.tls.is_some() { 443 } else { 80 };
    let document_root = spec.document_root.display();
    let mut out = String::new();

    out.push_str(&format!("<VirtualHost *:{}>\n", port));
    out.push_str(&format!("    ServerName {}\n", spec.server_name));
    for alias in &spec.aliases {
        out.push_str(&format!("    ServerAlias {}\n", alias));
    }
    out.push_str(&format!("    ServerAdmin {}\n", spec.admin_email));
    out.push_str(&format!("    DocumentRoot {}\n", document_root));

    out.push_str(&format!(
        "\n    ErrorLog {}\n    CustomLog {} combined\n",
        spec.log_path("error"),
        spec.log_path("access"),
    ));

    out.push_str(&format!(
        "\
\n    <Directory {document_root}>
        Options -Indexes +FollowSymLinks
        AllowOverride All
        Require all granted
    </Directory>
",
    ));

    for alias in &spec.path_aliases {
        out.push_str(&format!(
            "\n    Alias {url} {dir}\n    <Directory {dir}>\n        Require all granted\n    </Directory>\n",
            url = alias.url_path,
            dir = alias.directory,
        ));
    }

    match &spec.handler {
        VhostHandler::Php { socket } => {
            out.push_str(&format!(
                "\
\n    <FilesMatch \\.php$>
        SetHandler \"proxy:unix:{socket}|fcgi://localhost\"
    </FilesMatch>
",
            ));
        }
        VhostHandler::Proxy { port } => {
            out.push_str(&format!(
                "\
\n    ProxyPreserveHost On
    RewriteEngine On
    RewriteCond %{{HTTP:Upgrade}} =websocket [NC]
    RewriteRule ^/(.*) ws://127.0.0.1:{port}/$1 [P,L]
    ProxyPass / http://127.0.0.1:{port}/
    ProxyPassReverse / http://127.0.0.1:{port}/
",
            ));
        }
    }

    if let Some(tls) = &spec.tls {
        out.push_str(&format!(
            "\
\n    SSLEngine on
    SSLCertificateFile {cert}
    SSLCertificateKeyFile {key}
    SSLProtocol all -SSLv3 -TLSv1 -TLSv1.1
    Header always set Strict-Transport-Security \"max-age=31536000\"
",
            cert = tls.certificate,
            key = tls.key,
        ));
    }

    out.push_str("</VirtualHost>\n");
    out
}
