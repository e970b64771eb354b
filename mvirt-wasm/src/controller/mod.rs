//! Worker-process controller boundary.
//!
//! A controller supervises one OS-level worker process. The driver only talks
//! to it through [`WorkerController`]; launching and reattaching go through a
//! [`WorkerLauncher`]. [`process`] holds the implementation backed by the
//! executor shim.

pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::ControllerError;
use crate::types::TaskResourceUsage;

pub use process::{ProcessController, ProcessLauncher};

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub task_id: String,
    /// Program and arguments run under the executor.
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    /// Working directory of the worker.
    pub cwd: Option<PathBuf>,
    /// Directory owned by the controller for this task.
    pub state_dir: PathBuf,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

/// Capability descriptor that reconnects to a running worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachConfig {
    pub pid: u32,
    /// Process start time in seconds since the epoch, guards against pid reuse.
    pub start_time: u64,
    pub status_file: PathBuf,
    pub state_dir: PathBuf,
}

/// Terminal state of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: u32,
    pub exit_code: i32,
    pub signal: i32,
    pub time: DateTime<Utc>,
}

/// Supervises one running worker process.
#[async_trait]
pub trait WorkerController: Send + Sync {
    fn pid(&self) -> u32;

    /// Descriptor to persist for a later [`WorkerLauncher::reattach`].
    fn reattach_config(&self) -> ReattachConfig;

    /// Block until the worker exits.
    async fn wait(&self) -> Result<ProcessState, ControllerError>;

    async fn signal(&self, signal: Signal) -> Result<(), ControllerError>;

    /// Send `signal`, then force-kill if the worker outlives `timeout`.
    /// A zero timeout kills immediately.
    async fn shutdown(&self, signal: Signal, timeout: Duration) -> Result<(), ControllerError>;

    /// Whether the worker process is gone.
    fn exited(&self) -> bool;

    /// Periodic resource usage samples until `cancel` fires or the worker exits.
    fn stats(&self, interval: Duration, cancel: CancellationToken)
    -> ReceiverStream<TaskResourceUsage>;

    /// Release controller-owned resources after the worker is gone.
    async fn release(&self);
}

/// Creates controllers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerController>, ControllerError>;

    async fn reattach(
        &self,
        config: &ReattachConfig,
    ) -> Result<Box<dyn WorkerController>, ControllerError>;
}
