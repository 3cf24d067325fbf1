//! Table of live interactive shell sessions.

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ShellSessionInfo {
    pub id: u64,
    pub username: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Every shell the gateway has open. Sessions deregister themselves when
/// either side closes; `terminate_all` covers daemon shutdown.
#[derive(Clone, Default)]
pub struct ShellSessions {
    sessions: Arc<Mutex<HashMap<u64, ShellSessionInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl ShellSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ShellSessionInfo>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, username: &str, pid: u32) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(
            id,
            ShellSessionInfo {
                id,
                username: username.to_string(),
                pid,
                started_at: Utc::now(),
            },
        );
        info!(session = id, username, pid, "Shell session registered");
        id
    }

    pub fn deregister(&self, id: u64) -> Option<ShellSessionInfo> {
        let removed = self.lock().remove(&id);
        if let Some(session) = &removed {
            debug!(session = id, username = %session.username, "Shell session deregistered");
        }
        removed
    }

    pub fn list(&self) -> Vec<ShellSessionInfo> {
        let mut all: Vec<ShellSessionInfo> = self.lock().values().cloned().collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn count_for(&self, username: &str) -> usize {
        self.lock().values().filter(|s| s.username == username).count()
    }

    /// SIGKILL every registered shell's process group and empty the table.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<ShellSessionInfo> = self.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            if let Err(e) = killpg(Pid::from_raw(session.pid as i32), Signal::SIGKILL) {
                warn!(session = session.id, pid = session.pid, error = %e, "Failed to kill shell");
            }
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Terminated shell sessions");
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_deregister() {
        let sessions = ShellSessions::new();
        let a = sessions.register("alice", 4242);
        let b = sessions.register("bob", 4343);
        assert_ne!(a, b);
        assert_eq!(sessions.count(), 2);
        assert_eq!(sessions.count_for("alice"), 1);

        let removed = sessions.deregister(a).unwrap();
        assert_eq!(removed.username, "alice");
        assert!(sessions.deregister(a).is_none());
        assert_eq!(sessions.list().len(), 1);
        assert_eq!(sessions.list()[0].id, b);
    }
}
