//! The single path from the panel to `fork`/`exec`.

pub mod pty;
pub mod runner;

pub use runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError};
