//! Per-task state machine.
//!
//! A handle starts `Running` and makes exactly one transition, into `Exited`
//! when the worker's exit was observed or into `Unknown` when waiting on the
//! worker failed. The supervisor ([`TaskHandle::run`]) is the only writer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TaskConfig;
use crate::controller::WorkerController;
use crate::state::RecoveryState;
use crate::types::{ExitResult, TaskState, TaskStatus};

struct Lifecycle {
    state: TaskState,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
}

pub struct TaskHandle {
    config: TaskConfig,
    started_at: DateTime<Utc>,
    controller: Box<dyn WorkerController>,
    lifecycle: RwLock<Lifecycle>,
    exit_tx: watch::Sender<Option<ExitResult>>,
}

impl TaskHandle {
    pub fn new(
        config: TaskConfig,
        controller: Box<dyn WorkerController>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            config,
            started_at,
            controller,
            lifecycle: RwLock::new(Lifecycle {
                state: TaskState::Running,
                completed_at: None,
                exit_result: None,
            }),
            exit_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn pid(&self) -> u32 {
        self.controller.pid()
    }

    pub fn controller(&self) -> &dyn WorkerController {
        self.controller.as_ref()
    }

    pub async fn state(&self) -> TaskState {
        self.lifecycle.read().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.read().await.state == TaskState::Running
    }

    /// Snapshot of the handle. Never touches the worker.
    pub async fn status(&self) -> TaskStatus {
        let lifecycle = self.lifecycle.read().await;
        let mut driver_attributes = HashMap::new();
        driver_attributes.insert("pid".to_string(), self.pid().to_string());

        TaskStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            state: lifecycle.state,
            started_at: self.started_at,
            completed_at: lifecycle.completed_at,
            exit_result: lifecycle.exit_result.clone(),
            driver_attributes,
        }
    }

    /// State handed to the orchestrator for a later recovery.
    pub fn recovery_state(&self) -> RecoveryState {
        RecoveryState {
            reattach: self.controller.reattach_config(),
            task_config: self.config.clone(),
            started_at: self.started_at,
            pid: self.pid(),
        }
    }

    /// Receiver that holds the exit result once the handle is terminal.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitResult>> {
        self.exit_tx.subscribe()
    }

    /// Supervise the worker until it exits.
    ///
    /// Returns the terminal state and result, or `None` when `shutdown` fired
    /// first. In that case the handle stays `Running` and the worker is left
    /// alone for a later recovery.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Option<(TaskState, ExitResult)> {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return None,
            outcome = self.controller.wait() => outcome,
        };

        let (state, result) = match outcome {
            Ok(exit) => {
                info!(task_id = %self.id(), exit_code = exit.exit_code, signal = exit.signal, "Task exited");
                (
                    TaskState::Exited,
                    ExitResult {
                        exit_code: exit.exit_code,
                        signal: exit.signal,
                        oom_killed: false,
                        err: None,
                    },
                )
            }
            Err(e) => {
                warn!(task_id = %self.id(), error = %e, "Lost supervision of task");
                (
                    TaskState::Unknown,
                    ExitResult {
                        err: Some(e.to_string()),
                        ..Default::default()
                    },
                )
            }
        };

        {
            let mut lifecycle = self.lifecycle.write().await;
            lifecycle.state = state;
            lifecycle.completed_at = Some(Utc::now());
            lifecycle.exit_result = Some(result.clone());
        }
        self.exit_tx.send_replace(Some(result.clone()));

        Some((state, result))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use nix::sys::signal::Signal;
    use std::path::PathBuf;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;
    use crate::controller::{ProcessState, ReattachConfig};
    use crate::error::ControllerError;
    use crate::types::TaskResourceUsage;

    type Outcome = Option<Result<(i32, i32), String>>;

    /// Controller whose worker exits when the test says so.
    pub(crate) struct FakeController {
        pid: u32,
        outcome: watch::Receiver<Outcome>,
        exited: AtomicBool,
    }

    pub(crate) struct ExitTrigger(watch::Sender<Outcome>);

    impl ExitTrigger {
        pub(crate) fn exit(&self, code: i32) {
            self.0.send_replace(Some(Ok((code, 0))));
        }

        pub(crate) fn kill(&self, signal: i32) {
            self.0.send_replace(Some(Ok((0, signal))));
        }

        pub(crate) fn fail(&self, reason: &str) {
            self.0.send_replace(Some(Err(reason.to_string())));
        }
    }

    impl FakeController {
        pub(crate) fn new(pid: u32) -> (Box<dyn WorkerController>, ExitTrigger) {
            let (tx, rx) = watch::channel(None);
            let controller = Self {
                pid,
                outcome: rx,
                exited: AtomicBool::new(false),
            };
            (Box::new(controller), ExitTrigger(tx))
        }
    }

    #[async_trait]
    impl WorkerController for FakeController {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn reattach_config(&self) -> ReattachConfig {
            ReattachConfig {
                pid: self.pid,
                start_time: 0,
                status_file: PathBuf::from("/nonexistent/exit.json"),
                state_dir: PathBuf::from("/nonexistent"),
            }
        }

        async fn wait(&self) -> Result<ProcessState, ControllerError> {
            let mut rx = self.outcome.clone();
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone())
                .map_err(|_| ControllerError::Lost("trigger dropped".to_string()))?;
            self.exited.store(true, Ordering::Release);
            match outcome {
                Some(Ok((exit_code, signal))) => Ok(ProcessState {
                    pid: self.pid,
                    exit_code,
                    signal,
                    time: Utc::now(),
                }),
                Some(Err(reason)) => Err(ControllerError::Lost(reason)),
                None => Err(ControllerError::Lost("no outcome".to_string())),
            }
        }

        async fn signal(&self, _signal: Signal) -> Result<(), ControllerError> {
            Ok(())
        }

        async fn shutdown(&self, _signal: Signal, _timeout: Duration) -> Result<(), ControllerError> {
            Ok(())
        }

        fn exited(&self) -> bool {
            self.exited.load(Ordering::Acquire)
        }

        fn stats(
            &self,
            _interval: Duration,
            _cancel: CancellationToken,
        ) -> ReceiverStream<TaskResourceUsage> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            ReceiverStream::new(rx)
        }

        async fn release(&self) {}
    }

    pub(crate) fn handle_for(config: TaskConfig, controller: Box<dyn WorkerController>) -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(config, controller, Utc::now()))
    }
}
