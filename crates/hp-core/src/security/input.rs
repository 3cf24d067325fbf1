//! Strict allowlist-based input validation.
//!
//! Every external input that flows into subprocess arguments, file paths,
//! database rows, or rendered configuration MUST pass through one of these
//! validators first.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors returned when input fails validation.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),
    #[error("Invalid database name: {0}")]
    InvalidDatabaseName(String),
    #[error("Invalid username: {0}")]
    InvalidUsername(String),
    #[error("Username is reserved: {0}")]
    ReservedUsername(String),
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),
    #[error("Invalid path component: {0}")]
    InvalidPathComponent(String),
    #[error("Invalid PHP version: {0}")]
    InvalidPhpVersion(String),
    #[error("Invalid mailbox name: {0}")]
    InvalidLocalPart(String),
    #[error("Input too long: max {max} chars, got {actual}")]
    TooLong { max: usize, actual: usize },
    #[error("Input contains forbidden characters: {0}")]
    ForbiddenCharacters(String),
    #[error("Password does not meet requirements")]
    WeakPassword,
}

/// Names that collide with system accounts or daemon users.
pub const RESERVED_USERNAMES: &[&str] = &[
    "root",
    "admin",
    "administrator",
    "www-data",
    "nginx",
    "mysql",
    "postgres",
    "mail",
    "ftp",
];

/// MySQL / MariaDB identifier limits.
pub const MYSQL_DATABASE_NAME_MAX: usize = 64;
pub const MYSQL_USER_NAME_MAX: usize = 32;

// ---------------------------------------------------------------------------
// Strict regex patterns -- allowlists only, never denylists.
// ---------------------------------------------------------------------------

/// Account name: POSIX-safe, starts with a letter, 3-32 chars total.
static ACCOUNT_USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{2,31}$").unwrap());

/// Conservative RFC 1123 domain: alphanumeric-bounded labels, alphabetic TLD.
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*\.[a-z]{2,63}$",
    )
    .unwrap()
});

/// RFC 5321 compatible email address (simplified but safe).
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*\.[a-zA-Z]{2,}$",
    )
    .unwrap()
});

/// Mailbox local part: the subset that is also a safe path component.
static LOCAL_PART_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9._+-]{0,62}[a-z0-9])?$").unwrap());

/// MySQL / MariaDB identifier body.
static DB_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]{1,64}$").unwrap());

/// Hostname (RFC 952 / RFC 1123).
static HOSTNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9.-]{0,253}[a-zA-Z0-9])?$").unwrap());

/// Safe path component: no slashes, no traversal, no shell metacharacters.
static SAFE_PATH_COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]{1,255}$").unwrap());

static PHP_VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[5-9]\.[0-9]$").unwrap());

/// Shell metacharacters that must never appear in any input passed to subprocesses.
const SHELL_METACHARACTERS: &[char] = &[
    '`', '$', '(', ')', '{', '}', '[', ']', '|', ';', '&', '<', '>', '\n', '\r', '\0', '\\', '"',
    '\'',
];

// ---------------------------------------------------------------------------
// Public validation functions
// ---------------------------------------------------------------------------

/// Validate a hosting account username.
///
/// Accepts `^[a-z][a-z0-9_]{2,31}$` minus the reserved system names.
pub fn validate_account_username(username: &str) -> Result<&str, ValidationError> {
    if !ACCOUNT_USERNAME_RE.is_match(username) {
        return Err(ValidationError::InvalidUsername(username.to_string()));
    }
    if RESERVED_USERNAMES.contains(&username) {
        return Err(ValidationError::ReservedUsername(username.to_string()));
    }
    Ok(username)
}

/// Validate a fully-qualified domain name. Input must already be lowercase.
///
/// Rejects: empty, too long (>253), leading/trailing hyphens in any label,
/// empty labels, bare TLDs, whitespace, and anything outside the allowlist.
pub fn validate_domain(domain: &str) -> Result<&str, ValidationError> {
    if domain.len() > 253 {
        return Err(ValidationError::TooLong {
            max: 253,
            actual: domain.len(),
        });
    }
    if !DOMAIN_RE.is_match(domain) {
        return Err(ValidationError::InvalidDomain(domain.to_string()));
    }
    Ok(domain)
}

/// Lowercase and validate a domain coming from a request body.
pub fn normalize_domain(domain: &str) -> Result<String, ValidationError> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    validate_domain(&normalized)?;
    Ok(normalized)
}

/// Validate an email address.
pub fn validate_email(email: &str) -> Result<&str, ValidationError> {
    if email.len() > 254 {
        return Err(ValidationError::TooLong {
            max: 254,
            actual: email.len(),
        });
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    }
    Ok(email)
}

/// Validate the part of a mailbox address before the `@`.
pub fn validate_local_part(local: &str) -> Result<&str, ValidationError> {
    if !LOCAL_PART_RE.is_match(local) || local.contains("..") {
        return Err(ValidationError::InvalidLocalPart(local.to_string()));
    }
    Ok(local)
}

/// Validate a hostname (RFC 952 / RFC 1123).
pub fn validate_hostname(hostname: &str) -> Result<&str, ValidationError> {
    if hostname.len() > 253 {
        return Err(ValidationError::TooLong {
            max: 253,
            actual: hostname.len(),
        });
    }
    if !HOSTNAME_RE.is_match(hostname) {
        return Err(ValidationError::InvalidHostname(hostname.to_string()));
    }
    Ok(hostname)
}

/// Validate a `major.minor` PHP version string such as `8.2`.
pub fn validate_php_version(version: &str) -> Result<&str, ValidationError> {
    if !PHP_VERSION_RE.is_match(version) {
        return Err(ValidationError::InvalidPhpVersion(version.to_string()));
    }
    Ok(version)
}

/// Validate a single path component (file or directory name, NOT a full path).
pub fn validate_path_component(component: &str) -> Result<&str, ValidationError> {
    if component.contains("..")
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0')
    {
        return Err(ValidationError::InvalidPathComponent(component.to_string()));
    }
    if !SAFE_PATH_COMPONENT_RE.is_match(component) {
        return Err(ValidationError::InvalidPathComponent(component.to_string()));
    }
    Ok(component)
}

/// Assert that a string contains no shell metacharacters.
pub fn assert_no_shell_metacharacters(input: &str) -> Result<&str, ValidationError> {
    for ch in SHELL_METACHARACTERS {
        if input.contains(*ch) {
            return Err(ValidationError::ForbiddenCharacters(format!(
                "contains forbidden character: {:?}",
                ch
            )));
        }
    }
    Ok(input)
}

/// Validate password strength requirements.
///
/// At least 12 characters with upper, lower, digit and special characters.
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < 12 {
        return Err(ValidationError::WeakPassword);
    }
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric());

    if !(has_upper && has_lower && has_digit && has_special) {
        return Err(ValidationError::WeakPassword);
    }
    Ok(())
}

/// Build `<owner>_<name>` for an external database or database user.
///
/// A name that already carries the owner's prefix is not prefixed twice. The
/// result is truncated to `limit` characters; truncation only ever eats into
/// the user-chosen suffix, so an owner too long to leave room for at least one
/// suffix character is rejected.
pub fn namespaced_identifier(owner: &str, name: &str, limit: usize) -> Result<String, ValidationError> {
    let prefix = format!("{}_", owner);
    let suffix = name.strip_prefix(&prefix).unwrap_or(name);

    if suffix.is_empty() || !DB_NAME_RE.is_match(suffix) {
        return Err(ValidationError::InvalidDatabaseName(name.to_string()));
    }
    if prefix.len() >= limit {
        return Err(ValidationError::TooLong {
            max: limit,
            actual: prefix.len() + suffix.len(),
        });
    }

    let mut full = format!("{}{}", prefix, suffix);
    full.truncate(limit);
    Ok(full)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
