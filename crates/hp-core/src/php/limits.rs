//! Per-domain INI overrides and the package caps they are clamped to.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LimitError {
    #[error("Invalid size for {key}: {value}")]
    InvalidSize { key: &'static str, value: String },
    #[error("Invalid error_reporting expression: {0}")]
    InvalidErrorReporting(String),
}

/// `128M`, `1G`, `512K` or a plain byte count.
static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]{1,12})([KMGkmg]?)$").unwrap());

/// Constant expressions such as `E_ALL & ~E_DEPRECATED`.
static ERROR_REPORTING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_0-9 &|~^()-]{1,128}$").unwrap());

/// Bytes represented by a PHP shorthand size.
pub fn parse_size(value: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(value.trim())?;
    let number: u64 = caps[1].parse().ok()?;
    let factor = match caps[2].to_ascii_uppercase().as_str() {
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        _ => 1,
    };
    number.checked_mul(factor)
}

/// Package caps for PHP settings. Zero or empty means no cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhpLimits {
    pub memory_limit: String,
    pub upload_max_filesize: String,
    pub max_execution_time: u32,
}

impl Default for PhpLimits {
    fn default() -> Self {
        Self {
            memory_limit: "256M".to_string(),
            upload_max_filesize: "64M".to_string(),
            max_execution_time: 300,
        }
    }
}

/// Domain-level INI overrides. Unset fields keep the FPM defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IniOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_max_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_max_filesize: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_errors: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reporting: Option<String>,
}

impl IniOverrides {
    /// Reject anything that is not a well-formed value. Values end up inside
    /// a pool file, so this is also what keeps newlines out.
    pub fn validate(&self) -> Result<(), LimitError> {
        let sizes = [
            ("memory_limit", &self.memory_limit),
            ("post_max_size", &self.post_max_size),
            ("upload_max_filesize", &self.upload_max_filesize),
        ];
        for (key, value) in sizes {
            if let Some(v) = value {
                if parse_size(v).is_none() {
                    return Err(LimitError::InvalidSize {
                        key,
                        value: v.clone(),
                    });
                }
            }
        }
        if let Some(expr) = &self.error_reporting {
            if !ERROR_REPORTING_RE.is_match(expr) {
                return Err(LimitError::InvalidErrorReporting(expr.clone()));
            }
        }
        Ok(())
    }

    /// Lower every value above its cap to the cap itself. Post and upload
    /// sizes share the package upload cap.
    pub fn clamp(&self, limits: &PhpLimits) -> Self {
        let max_execution_time = match (self.max_execution_time, limits.max_execution_time) {
            (Some(v), cap) if cap > 0 && v > cap => Some(cap),
            // 0 means "no limit" to PHP, which would escape any cap.
            (Some(0), cap) if cap > 0 => Some(cap),
            (v, _) => v,
        };
        Self {
            memory_limit: clamp_size(&self.memory_limit, &limits.memory_limit),
            max_execution_time,
            post_max_size: clamp_size(&self.post_max_size, &limits.upload_max_filesize),
            upload_max_filesize: clamp_size(&self.upload_max_filesize, &limits.upload_max_filesize),
            display_errors: self.display_errors,
            error_reporting: self.error_reporting.clone(),
        }
    }

    /// Overlay the fields set in `other`.
    pub fn merge(&self, other: &IniOverrides) -> Self {
        Self {
            memory_limit: other.memory_limit.clone().or_else(|| self.memory_limit.clone()),
            max_execution_time: other.max_execution_time.or(self.max_execution_time),
            post_max_size: other.post_max_size.clone().or_else(|| self.post_max_size.clone()),
            upload_max_filesize: other
                .upload_max_filesize
                .clone()
                .or_else(|| self.upload_max_filesize.clone()),
            display_errors: other.display_errors.or(self.display_errors),
            error_reporting: other
                .error_reporting
                .clone()
                .or_else(|| self.error_reporting.clone()),
        }
    }

    /// Pool directives in a fixed order.
    pub fn directives(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(v) = &self.memory_limit {
            out.push(("php_admin_value[memory_limit]".to_string(), v.clone()));
        }
        if let Some(v) = self.max_execution_time {
            out.push(("php_admin_value[max_execution_time]".to_string(), v.to_string()));
        }
        if let Some(v) = &self.post_max_size {
            out.push(("php_admin_value[post_max_size]".to_string(), v.clone()));
        }
        if let Some(v) = &self.upload_max_filesize {
            out.push(("php_admin_value[upload_max_filesize]".to_string(), v.clone()));
        }
        if let Some(v) = self.display_errors {
            let flag = if v { "on" } else { "off" };
            out.push(("php_admin_flag[display_errors]".to_string(), flag.to_string()));
        }
        if let Some(v) = &self.error_reporting {
            out.push(("php_admin_value[error_reporting]".to_string(), v.clone()));
        }
        out
    }
}

/// Directive keys this module owns inside a pool file.
pub const OVERRIDE_KEYS: &[&str] = &[
    "php_admin_value[memory_limit]",
    "php_admin_value[max_execution_time]",
    "php_admin_value[post_max_size]",
    "php_admin_value[upload_max_filesize]",
    "php_admin_flag[display_errors]",
    "php_admin_value[error_reporting]",
];

fn clamp_size(value: &Option<String>, cap: &str) -> Option<String> {
    let value = value.as_ref()?;
    let cap_bytes = match parse_size(cap) {
        Some(0) | None => return Some(value.clone()),
        Some(bytes) => bytes,
    };
    match parse_size(value) {
        Some(bytes) if bytes > cap_bytes => Some(cap.to_string()),
        _ => Some(value.clone()),
    }
}
