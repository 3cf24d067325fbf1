//! Embedded SQLite metadata store for the hosting panel.

pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{Database, DbError};
