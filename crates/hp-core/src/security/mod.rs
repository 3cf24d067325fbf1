//! Security utilities: strict allowlist input validation for everything that
//! reaches a subprocess argument, a file path, or rendered configuration, plus
//! login password hashing.

pub mod credentials;
pub mod input;
