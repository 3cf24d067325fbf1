//! Host-level account primitives.

pub mod users;

pub use users::{PosixIdentity, PosixUsers, UserError};
