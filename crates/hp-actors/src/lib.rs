//! Long-lived in-process actors: streamed tasks, shell sessions and the
//! mail queue worker.

pub mod mail_worker;
pub mod shell;
pub mod tasks;

pub use mail_worker::{MailWorker, TickReport, WorkerConfig, WorkerError};
pub use shell::{ShellSessionInfo, ShellSessions};
pub use tasks::{spawn_command_task, TaskError, TaskRegistry, TaskSnapshot, TaskState};
