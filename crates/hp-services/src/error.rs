use hp_db::DbError;

/// Failure category shared by every service error. The daemon turns it into
/// an HTTP status; services never see HTTP themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Forbidden,
    NotFound,
    Conflict,
    Internal,
}

/// Generic text for authorisation failures. It never names the target so a
/// caller cannot discover other tenants' resources.
pub const ACCESS_DENIED: &str = "Access denied";

pub(crate) fn db_kind(error: &DbError) -> ErrorKind {
    match error {
        DbError::NotFound(_) => ErrorKind::NotFound,
        DbError::Duplicate(_) => ErrorKind::Conflict,
        _ => ErrorKind::Internal,
    }
}
