use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::config::{DriverConfig, TaskConfig, WasmTaskConfig};
use crate::controller::{LaunchSpec, ProcessLauncher, WorkerLauncher};
use crate::error::{ConfigError, DriverError, Result};
use crate::events::{Eventer, TaskEvent};
use crate::fingerprint::{self, Fingerprint};
use crate::handle::TaskHandle;
use crate::plugin::{Capabilities, DriverPlugin, ExecResult, PLUGIN_NAME, PluginInfo};
use crate::signal::signal_or_default;
use crate::state::RecoveryHandle;
use crate::store::TaskStore;
use crate::types::{ExitResult, TaskResourceUsage, TaskStatus};

/// The wasmtime task driver.
pub struct Driver {
    config: DriverConfig,
    launcher: Arc<dyn WorkerLauncher>,
    store: TaskStore,
    events: Arc<Eventer>,
    shutdown: CancellationToken,
}

impl Driver {
    /// Driver over `launcher`. Fails if `config` does not validate.
    pub fn new(config: DriverConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let events = Arc::new(Eventer::new(config.event_buffer, shutdown.clone()));
        Ok(Self {
            config,
            launcher,
            store: TaskStore::new(),
            events,
            shutdown,
        })
    }

    /// Driver that runs workers under this binary's executor shim, or the
    /// one named in the config.
    pub fn with_process_launcher(config: DriverConfig) -> Result<Self> {
        let executor_path = match &config.executor_path {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(ConfigError::from)?,
        };
        let launcher = ProcessLauncher::new(executor_path)
            .with_stats_floor(config.stats_interval_floor());
        Self::new(config, Arc::new(launcher))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub async fn task_count(&self) -> usize {
        self.store.len().await
    }

    async fn lookup(&self, id: &str) -> Result<Arc<TaskHandle>> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| DriverError::NotFound(id.to_string()))
    }

    fn spawn_supervisor(&self, handle: Arc<TaskHandle>) {
        let events = Arc::clone(&self.events);
        let shutdown = self.shutdown.clone();
        let span = info_span!("driver", plugin = PLUGIN_NAME, task_id = %handle.id());

        tokio::spawn(
            async move {
                let config = handle.config().clone();
                let Some((state, result)) = handle.run(shutdown).await else {
                    debug!("Driver shutting down, leaving task running");
                    return;
                };

                let event = match &result.err {
                    Some(err) => TaskEvent::new(&config, "Task supervision failed").with_err(err.clone()),
                    None => TaskEvent::new(&config, "Task exited")
                        .annotate("exit_code", result.exit_code)
                        .annotate("signal", result.signal),
                };
                debug!(state = %state, "Supervisor finished");
                events.emit(event).await;
            }
            .instrument(span),
        );
    }

    fn launch_spec(&self, task: &TaskConfig, wasm: &WasmTaskConfig) -> LaunchSpec {
        let mut command = vec![self.config.runtime_path.display().to_string()];
        command.extend(wasm.runtime_args());

        LaunchSpec {
            task_id: task.id.clone(),
            command,
            env: task.env.clone(),
            cwd: task.task_dir.clone(),
            state_dir: self.config.task_state_dir(&task.id),
            stdout_path: task.stdout_path.clone(),
            stderr_path: task.stderr_path.clone(),
        }
    }
}

#[async_trait]
impl DriverPlugin for Driver {
    fn plugin_info(&self) -> PluginInfo {
        PluginInfo::wasmtime()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::wasmtime()
    }

    async fn fingerprint(&self, cancel: CancellationToken) -> Result<ReceiverStream<Fingerprint>> {
        Ok(fingerprint::fingerprint_stream(
            self.config.runtime_path.clone(),
            self.config.fingerprint_period(),
            cancel,
            self.shutdown.clone(),
        ))
    }

    #[instrument(name = "driver", skip_all, fields(plugin = PLUGIN_NAME, task_id = %config.id))]
    async fn start_task(&self, config: TaskConfig) -> Result<RecoveryHandle> {
        let id = config.id.clone();
        if id.is_empty() {
            return Err(ConfigError::Missing("id").into());
        }
        if self.store.get(&id).await.is_some() {
            return Err(DriverError::AlreadyExists(id));
        }

        let wasm = WasmTaskConfig::from_task(&config)?;
        info!(file = %wasm.file, "Starting task");

        let started_at = Utc::now();
        let spec = self.launch_spec(&config, &wasm);
        let controller = self.launcher.launch(spec).await.map_err(DriverError::Launch)?;
        let handle = Arc::new(TaskHandle::new(config, controller, started_at));

        let recovery = match RecoveryHandle::new(handle.config().clone(), &handle.recovery_state()) {
            Ok(recovery) => recovery,
            Err(e) => {
                error!(error = %e, "Failed to encode task state, killing worker");
                if let Err(kill_err) = handle.controller().shutdown(Signal::SIGKILL, Duration::ZERO).await {
                    error!(error = %kill_err, "Failed to kill worker");
                }
                handle.controller().release().await;
                return Err(e);
            }
        };

        if !self.store.insert_if_absent(&id, Arc::clone(&handle)).await {
            // A concurrent start with the same id won. Its state directory is
            // shared with ours, so only the worker goes.
            warn!("Lost start race, killing duplicate worker");
            if let Err(e) = handle.controller().shutdown(Signal::SIGKILL, Duration::ZERO).await {
                error!(error = %e, "Failed to kill duplicate worker");
            }
            return Err(DriverError::AlreadyExists(id));
        }

        let pid = handle.pid();
        info!(pid, "Task started");
        self.events
            .emit(TaskEvent::new(handle.config(), "Task started").annotate("pid", pid))
            .await;
        self.spawn_supervisor(handle);

        Ok(recovery)
    }

    #[instrument(name = "driver", skip_all, fields(plugin = PLUGIN_NAME, task_id = %handle.config.id))]
    async fn recover_task(&self, handle: &RecoveryHandle) -> Result<()> {
        let id = handle.config.id.clone();
        if self.store.get(&id).await.is_some() {
            debug!("Task already tracked, nothing to recover");
            return Ok(());
        }

        let state = handle.driver_state()?;
        let controller = self
            .launcher
            .reattach(&state.reattach)
            .await
            .map_err(DriverError::ReattachFailed)?;
        let task = Arc::new(TaskHandle::new(state.task_config, controller, state.started_at));

        if !self.store.insert_if_absent(&id, Arc::clone(&task)).await {
            // Another recover got there first; drop our controller and leave
            // the worker to theirs.
            debug!("Task recovered concurrently");
            return Ok(());
        }

        info!(pid = task.pid(), "Task recovered");
        self.events
            .emit(TaskEvent::new(task.config(), "Task recovered").annotate("pid", task.pid()))
            .await;
        self.spawn_supervisor(task);

        Ok(())
    }

    async fn wait_task(&self, id: &str, cancel: CancellationToken) -> Result<ReceiverStream<ExitResult>> {
        let handle = self.lookup(id).await?;
        let mut exit_rx = handle.subscribe_exit();
        drop(handle);

        let (tx, rx) = mpsc::channel(1);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shutdown.cancelled() => return,
                result = async { exit_rx.wait_for(Option::is_some).await.map(|r| r.clone()) } => match result {
                    Ok(result) => result,
                    // Handle destroyed before it went terminal.
                    Err(_) => return,
                },
            };
            if let Some(result) = result {
                let _ = tx.send(result).await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    #[instrument(name = "driver", skip_all, fields(plugin = PLUGIN_NAME, task_id = %id))]
    async fn stop_task(&self, id: &str, timeout: Duration, signal: &str) -> Result<()> {
        let handle = self.lookup(id).await?;
        let signal = signal_or_default(signal);
        info!(signal = %signal, timeout = ?timeout, "Stopping task");

        match handle.controller().shutdown(signal, timeout).await {
            Ok(()) => Ok(()),
            Err(e) if handle.controller().exited() => {
                debug!(error = %e, "Shutdown failed on exited worker, ignoring");
                Ok(())
            }
            Err(e) => Err(DriverError::Shutdown(e)),
        }
    }

    #[instrument(name = "driver", skip_all, fields(plugin = PLUGIN_NAME, task_id = %id))]
    async fn destroy_task(&self, id: &str, force: bool) -> Result<()> {
        let handle = self.lookup(id).await?;
        if handle.is_running().await && !force {
            return Err(DriverError::StillRunning(id.to_string()));
        }

        if !handle.controller().exited() {
            if let Err(e) = handle.controller().shutdown(Signal::SIGKILL, Duration::ZERO).await {
                error!(error = %e, "Failed to kill task during destroy");
            }
        }
        handle.controller().release().await;
        self.store.delete(id).await;

        info!("Task destroyed");
        self.events
            .emit(TaskEvent::new(handle.config(), "Task destroyed"))
            .await;
        Ok(())
    }

    async fn inspect_task(&self, id: &str) -> Result<TaskStatus> {
        Ok(self.lookup(id).await?.status().await)
    }

    async fn task_stats(
        &self,
        id: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<TaskResourceUsage>> {
        let handle = self.lookup(id).await?;
        let sampler = CancellationToken::new();
        let mut samples = handle.controller().stats(interval, sampler.clone());
        drop(handle);

        // Relay so the sampler stops on whichever comes first: worker exit,
        // caller cancel, driver shutdown or the caller dropping the stream.
        let (tx, rx) = mpsc::channel(1);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _sampler = sampler.drop_guard();
            loop {
                let sample = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    sample = samples.next() => match sample {
                        Some(sample) => sample,
                        None => break,
                    },
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    sent = tx.send(sample) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn task_events(&self, cancel: CancellationToken) -> Result<ReceiverStream<TaskEvent>> {
        Ok(self.events.subscribe(cancel).await)
    }

    #[instrument(name = "driver", skip_all, fields(plugin = PLUGIN_NAME, task_id = %id))]
    async fn signal_task(&self, id: &str, signal: &str) -> Result<()> {
        let handle = self.lookup(id).await?;
        let signal = signal_or_default(signal);
        debug!(signal = %signal, "Signaling task");
        handle.controller().signal(signal).await.map_err(DriverError::Signal)
    }

    async fn exec_task(&self, _id: &str, _cmd: &[String], _timeout: Duration) -> Result<ExecResult> {
        Err(DriverError::Unsupported("exec"))
    }

    async fn shutdown(&self) {
        info!(plugin = PLUGIN_NAME, "Driver shutting down");
        self.shutdown.cancel();
    }
}
