//! Task status types shared between the driver and its callers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Exited,
    /// Supervision lost track of the worker.
    Unknown,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Exited => write!(f, "exited"),
            TaskState::Unknown => write!(f, "unknown"),
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    pub exit_code: i32,
    pub signal: i32,
    pub oom_killed: bool,
    /// Set when supervision failed rather than the worker exiting.
    pub err: Option<String>,
}

impl ExitResult {
    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal == 0 && self.err.is_none()
    }
}

/// Point-in-time view of a task handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_result: Option<ExitResult>,
    pub driver_attributes: HashMap<String, String>,
}

/// One resource usage sample of a task's process tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_rss_bytes: u64,
    pub pids: Vec<u32>,
}
