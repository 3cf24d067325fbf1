//! Process-wide registry of long-running tasks and their streamed output.

use chrono::{DateTime, Local, Utc};
use hp_core::exec::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines kept per task; older ones are dropped from the front.
pub const LOG_CAPACITY: usize = 100;

/// Per-subscriber queue depth. A full queue drops lines for that subscriber.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Prefix of the line sent to subscribers when a task reaches a final state.
pub const STATUS_SENTINEL: &str = "__STATUS__";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("Task already exists: {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Point-in-time copy of a task, safe to serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
}

/// What a new subscriber gets: everything logged so far and a receiver for
/// what comes next, taken under one lock so nothing falls in between.
#[derive(Debug)]
pub struct Subscription {
    pub subscriber_id: u64,
    pub backlog: Vec<String>,
    pub state: TaskState,
    pub receiver: mpsc::Receiver<String>,
}

/// Sentinel line announcing a final state.
pub fn status_line(state: TaskState) -> String {
    format!("{}{}", STATUS_SENTINEL, state.as_str())
}

/// Parse a sentinel line back into its state.
pub fn parse_status_line(line: &str) -> Option<TaskState> {
    match line.strip_prefix(STATUS_SENTINEL)? {
        "running" => Some(TaskState::Running),
        "completed" => Some(TaskState::Completed),
        "failed" => Some(TaskState::Failed),
        _ => None,
    }
}

struct TaskRecord {
    task_type: String,
    name: String,
    state: TaskState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    logs: VecDeque<String>,
    subscribers: Vec<(u64, mpsc::Sender<String>)>,
}

impl TaskRecord {
    fn snapshot(&self, id: &str) -> TaskSnapshot {
        TaskSnapshot {
            id: id.to_string(),
            task_type: self.task_type.clone(),
            name: self.name.clone(),
            state: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            logs: self.logs.iter().cloned().collect(),
        }
    }

    /// Non-blocking fan-out. Closed subscribers are forgotten.
    fn broadcast(&mut self, line: &str) {
        self.subscribers.retain(|(subscriber, tx)| match tx.try_send(line.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber, "Subscriber lagging, line dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Shared task table. Cloning hands out another handle to the same table.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
    next_subscriber: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a task in state `running`.
    pub fn create(&self, id: &str, task_type: &str, name: &str) -> Result<(), TaskError> {
        let mut tasks = self.write();
        if tasks.contains_key(id) {
            return Err(TaskError::Duplicate(id.to_string()));
        }
        tasks.insert(
            id.to_string(),
            TaskRecord {
                task_type: task_type.to_string(),
                name: name.to_string(),
                state: TaskState::Running,
                started_at: Utc::now(),
                finished_at: None,
                logs: VecDeque::with_capacity(LOG_CAPACITY),
                subscribers: Vec::new(),
            },
        );
        info!(task_id = id, task_type, name, "Task created");
        Ok(())
    }

    /// Append a timestamped line and fan it out. Unknown ids are ignored so
    /// a pruned task never breaks its producer.
    pub fn add_log(&self, id: &str, line: &str) {
        let stamped = format!("[{}] {}", Local::now().format("%H:%M:%S"), line);
        let mut tasks = self.write();
        let Some(task) = tasks.get_mut(id) else {
            debug!(task_id = id, "Log line for unknown task");
            return;
        };
        if task.logs.len() == LOG_CAPACITY {
            task.logs.pop_front();
        }
        task.logs.push_back(stamped.clone());
        task.broadcast(&stamped);
    }

    /// Move to the final state, notify subscribers once and release them.
    pub fn complete(&self, id: &str, success: bool) -> Result<TaskState, TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if task.state.is_terminal() {
            return Ok(task.state);
        }
        task.state = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        task.finished_at = Some(Utc::now());
        task.broadcast(&status_line(task.state));
        task.subscribers.clear();
        info!(task_id = id, state = task.state.as_str(), "Task finished");
        Ok(task.state)
    }

    /// Backlog plus a live receiver. For a finished task the receiver is
    /// already closed and `state` carries the outcome.
    pub fn subscribe(&self, id: &str) -> Result<Subscription, TaskError> {
        let mut tasks = self.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        if !task.state.is_terminal() {
            task.subscribers.push((subscriber_id, tx));
        }
        Ok(Subscription {
            subscriber_id,
            backlog: task.logs.iter().cloned().collect(),
            state: task.state,
            receiver,
        })
    }

    pub fn unsubscribe(&self, id: &str, subscriber_id: u64) {
        if let Some(task) = self.write().get_mut(id) {
            task.subscribers.retain(|(s, _)| *s != subscriber_id);
        }
    }

    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        self.read().get(id).map(|task| task.snapshot(id))
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .read()
            .iter()
            .map(|(id, task)| task.snapshot(id))
            .collect();
        all.sort_by_key(|t| t.started_at);
        all
    }

    /// Drop finished tasks that ended more than `older_than` ago.
    pub fn prune_finished(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, task| match task.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
        let pruned = before - tasks.len();
        if pruned > 0 {
            debug!(pruned, "Pruned finished tasks");
        }
        pruned
    }
}

/// Fresh task id.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run `steps` in order in the background, streaming every output line into
/// the task. The first failing step fails the task.
pub fn spawn_command_task(
    registry: TaskRegistry,
    runner: CommandRunner,
    id: String,
    steps: Vec<CommandSpec>,
) -> JoinHandle<TaskState> {
    tokio::spawn(async move {
        let success = run_steps(&registry, &runner, &id, &steps).await;
        registry.complete(&id, success).unwrap_or(TaskState::Failed)
    })
}

async fn run_steps(registry: &TaskRegistry, runner: &CommandRunner, id: &str, steps: &[CommandSpec]) -> bool {
    for (index, step) in steps.iter().enumerate() {
        registry.add_log(id, &format!("$ {}", step.display()));
        let sink = registry.clone();
        let task_id = id.to_string();
        let result = runner
            .run_streaming(step, move |line| sink.add_log(&task_id, &line))
            .await;
        match result {
            Ok(output) if output.success() => {}
            Ok(output) => {
                let message = format!("Step {} failed with {}", index + 1, output.status_label());
                warn!(task_id = id, command = %step.display(), "{}", message);
                registry.add_log(id, &message);
                return false;
            }
            Err(e) => {
                warn!(task_id = id, command = %step.display(), error = %e, "Task step errored");
                registry.add_log(id, &format!("Step {} error: {}", index + 1, e));
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_stamp(line: &str) -> &str {
        // "[HH:MM:SS] " is 11 bytes.
        &line[11..]
    }

    #[test]
    fn test_log_is_bounded_and_stamped() {
        let registry = TaskRegistry::new();
        registry.create("t1", "php-install", "Install PHP 8.2").unwrap();
        for i in 0..150 {
            registry.add_log("t1", &format!("line {}", i));
        }
        let snapshot = registry.get("t1").unwrap();
        assert_eq!(snapshot.logs.len(), LOG_CAPACITY);
        assert_eq!(strip_stamp(&snapshot.logs[0]), "line 50");
        assert_eq!(strip_stamp(&snapshot.logs[99]), "line 149");
        assert!(snapshot.logs[0].starts_with('['));
        assert_eq!(&snapshot.logs[0][9..11], "] ");
    }

    #[test]
    fn test_duplicate_create_is_rejected() {
        let registry = TaskRegistry::new();
        registry.create("t1", "php-install", "Install PHP 8.2").unwrap();
        assert_eq!(
            registry.create("t1", "php-install", "again"),
            Err(TaskError::Duplicate("t1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_subscriber_gets_backlog_then_live_then_status() {
        let registry = TaskRegistry::new();
        registry.create("t1", "php-install", "Install PHP 8.2").unwrap();
        registry.add_log("t1", "early");

        let mut sub = registry.subscribe("t1").unwrap();
        assert_eq!(sub.backlog.len(), 1);
        assert_eq!(strip_stamp(&sub.backlog[0]), "early");
        assert_eq!(sub.state, TaskState::Running);

        registry.add_log("t1", "late");
        registry.complete("t1", true).unwrap();

        let live = sub.receiver.recv().await.unwrap();
        assert_eq!(strip_stamp(&live), "late");
        let status = sub.receiver.recv().await.unwrap();
        assert_eq!(parse_status_line(&status), Some(TaskState::Completed));
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_completion_has_closed_receiver() {
        let registry = TaskRegistry::new();
        registry.create("t1", "component-install", "Install nginx").unwrap();
        registry.add_log("t1", "done");
        registry.complete("t1", false).unwrap();

        let mut sub = registry.subscribe("t1").unwrap();
        assert_eq!(sub.state, TaskState::Failed);
        assert_eq!(sub.backlog.len(), 1);
        assert!(sub.receiver.recv().await.is_none());
    }

    #[test]
    fn test_slow_subscriber_never_blocks_producer() {
        let registry = TaskRegistry::new();
        registry.create("t1", "php-install", "Install PHP 8.2").unwrap();
        let sub = registry.subscribe("t1").unwrap();
        for i in 0..(SUBSCRIBER_BUFFER + 50) {
            registry.add_log("t1", &format!("line {}", i));
        }
        // Producer finished; the subscriber kept only what fit.
        drop(sub);
        registry.add_log("t1", "after drop");
        assert_eq!(registry.get("t1").unwrap().logs.len(), LOG_CAPACITY);
    }

    #[test]
    fn test_unknown_task() {
        let registry = TaskRegistry::new();
        registry.add_log("missing", "ignored");
        assert!(registry.get("missing").is_none());
        assert!(matches!(registry.subscribe("missing"), Err(TaskError::NotFound(_))));
        assert!(matches!(registry.complete("missing", true), Err(TaskError::NotFound(_))));
    }

    #[test]
    fn test_prune_keeps_running_tasks() {
        let registry = TaskRegistry::new();
        registry.create("done", "php-install", "a").unwrap();
        registry.create("busy", "php-install", "b").unwrap();
        registry.complete("done", true).unwrap();

        assert_eq!(registry.prune_finished(chrono::Duration::hours(1)), 0);
        assert_eq!(registry.prune_finished(chrono::Duration::seconds(-1)), 1);
        assert!(registry.get("done").is_none());
        assert!(registry.get("busy").is_some());
    }

    #[tokio::test]
    async fn test_spawn_command_task_streams_simulated_steps() {
        let registry = TaskRegistry::new();
        let runner = CommandRunner::simulated();
        registry.create("t1", "php-install", "Install PHP 8.2").unwrap();
        let steps = vec![
            CommandSpec::new("apt-get").arg("update"),
            CommandSpec::new("systemctl").args(["enable", "--now", "php8.2-fpm"]),
        ];

        let state = spawn_command_task(registry.clone(), runner.clone(), "t1".to_string(), steps)
            .await
            .unwrap();
        assert_eq!(state, TaskState::Completed);

        let logs: Vec<String> = registry
            .get("t1")
            .unwrap()
            .logs
            .iter()
            .map(|l| strip_stamp(l).to_string())
            .collect();
        assert_eq!(
            logs,
            vec![
                "$ apt-get update",
                "[simulate] apt-get update",
                "$ systemctl enable --now php8.2-fpm",
                "[simulate] systemctl enable --now php8.2-fpm",
            ]
        );
        assert_eq!(runner.journal().len(), 2);
    }
}
