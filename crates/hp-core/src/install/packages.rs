use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Server components that can be installed from the panel, each a fixed set
/// of distribution packages plus the units to enable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Apache,
    Nginx,
    Bind,
    Mail,
    Webmail,
    Database,
    Certbot,
}

pub const ALL_COMPONENTS: &[Component] = &[
    Component::Apache,
    Component::Nginx,
    Component::Bind,
    Component::Mail,
    Component::Webmail,
    Component::Database,
    Component::Certbot,
];

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apache => "apache",
            Self::Nginx => "nginx",
            Self::Bind => "bind",
            Self::Mail => "mail",
            Self::Webmail => "webmail",
            Self::Database => "database",
            Self::Certbot => "certbot",
        }
    }

    pub fn packages(self) -> &'static [&'static str] {
        match self {
            Self::Apache => &["apache2", "libapache2-mod-fcgid"],
            Self::Nginx => &["nginx"],
            Self::Bind => &["bind9", "bind9-utils", "dnsutils"],
            Self::Mail => &[
                "postfix",
                "postfix-pcre",
                "postfix-policyd-spf-python",
                "dovecot-core",
                "dovecot-imapd",
                "dovecot-pop3d",
                "dovecot-lmtpd",
                "dovecot-sieve",
                "opendkim",
                "opendkim-tools",
                "spamassassin",
                "spamc",
            ],
            Self::Webmail => &["roundcube", "roundcube-core", "roundcube-plugins"],
            Self::Database => &["mariadb-server", "mariadb-client"],
            Self::Certbot => &["certbot"],
        }
    }

    /// systemd units started once the packages are in.
    pub fn units(self) -> &'static [&'static str] {
        match self {
            Self::Apache => &["apache2"],
            Self::Nginx => &["nginx"],
            Self::Bind => &["bind9"],
            Self::Mail => &["postfix", "dovecot", "opendkim"],
            Self::Webmail | Self::Certbot => &[],
            Self::Database => &["mariadb"],
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_COMPONENTS
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown component: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_names_round_trip() {
        for component in ALL_COMPONENTS {
            assert_eq!(component.as_str().parse::<Component>().unwrap(), *component);
        }
        assert!("sendmail".parse::<Component>().is_err());
    }

    #[test]
    fn test_packages_are_plain_names() {
        for component in ALL_COMPONENTS {
            for package in component.packages() {
                assert!(package
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-.+".contains(c)));
            }
        }
    }
}
