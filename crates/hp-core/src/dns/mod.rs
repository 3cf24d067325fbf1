//! Authoritative DNS zones.

pub mod manager;
pub mod zone;

pub use manager::{ZoneError, ZoneManager};
pub use zone::{RecordType, ZoneRecord};
