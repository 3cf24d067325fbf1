//! Filesystem primitives: host layout, atomic writes, line tables, ownership.

pub mod atomic;
pub mod lines;
pub mod paths;
pub mod permissions;

pub use paths::HostPaths;
