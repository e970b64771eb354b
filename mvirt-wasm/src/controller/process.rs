use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{LaunchSpec, ProcessState, ReattachConfig, WorkerController, WorkerLauncher};
use crate::error::ControllerError;
use crate::executor;
use crate::types::TaskResourceUsage;

/// How long a fresh executor must stay up before launch counts as successful.
const LAUNCH_GRACE: Duration = Duration::from_millis(100);
/// Liveness polling interval for processes we cannot `wait()` on.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

const STATUS_FILE: &str = "exit.json";

/// Launches workers under the executor shim.
pub struct ProcessLauncher {
    executor_path: PathBuf,
    stats_floor: Duration,
}

impl ProcessLauncher {
    pub fn new(executor_path: PathBuf) -> Self {
        Self {
            executor_path,
            stats_floor: Duration::from_millis(100),
        }
    }

    pub fn with_stats_floor(mut self, floor: Duration) -> Self {
        self.stats_floor = floor;
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerController>, ControllerError> {
        if spec.command.is_empty() {
            return Err(ControllerError::Spawn("empty command".to_string()));
        }

        tokio::fs::create_dir_all(&spec.state_dir).await?;
        let status_file = spec.state_dir.join(STATUS_FILE);
        if let Err(e) = tokio::fs::remove_file(&status_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        let stdout_path = spec
            .stdout_path
            .clone()
            .unwrap_or_else(|| spec.state_dir.join("stdout.log"));
        let stderr_path = spec
            .stderr_path
            .clone()
            .unwrap_or_else(|| spec.state_dir.join("stderr.log"));

        let mut cmd = Command::new(&self.executor_path);
        cmd.arg("executor")
            .arg("--status-file")
            .arg(&status_file)
            .arg("--")
            .args(&spec.command)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(open_log(&stdout_path)?)
            .stderr(open_log(&stderr_path)?)
            // Own process group: the worker must survive a driver crash, and
            // a forced kill takes the whole tree.
            .process_group(0);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        info!(task_id = %spec.task_id, cmd = ?cmd.as_std(), "Spawning executor");

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| ControllerError::Spawn("failed to get pid".to_string()))?;

        // Wait briefly to catch immediate failure
        tokio::time::sleep(LAUNCH_GRACE).await;
        if let Ok(Some(status)) = child.try_wait() {
            // A workload that finished inside the grace period is still a
            // successful launch if the executor recorded its exit.
            if executor::read_status(&status_file).await?.is_none() {
                let stderr_output = tokio::fs::read_to_string(&stderr_path)
                    .await
                    .unwrap_or_default();
                error!(task_id = %spec.task_id, status = ?status, stderr = %stderr_output, "Executor exited immediately");
                return Err(ControllerError::Spawn(format!(
                    "executor exited with {status}: {}",
                    stderr_output.trim()
                )));
            }
            debug!(task_id = %spec.task_id, "Workload finished during launch grace period");
        }

        let start_time = process_start_time(pid).unwrap_or(0);
        info!(task_id = %spec.task_id, pid, "Executor started");

        let reattach = ReattachConfig {
            pid,
            start_time,
            status_file,
            state_dir: spec.state_dir,
        };
        Ok(Box::new(ProcessController::new(
            reattach,
            Some(child),
            self.stats_floor,
        )))
    }

    async fn reattach(
        &self,
        config: &ReattachConfig,
    ) -> Result<Box<dyn WorkerController>, ControllerError> {
        if !config.state_dir.exists() {
            return Err(ControllerError::Gone(format!(
                "state directory {} missing",
                config.state_dir.display()
            )));
        }

        match process_info(config.pid) {
            None => {
                return Err(ControllerError::Gone(format!(
                    "pid {} not running",
                    config.pid
                )));
            }
            Some(info) if info.zombie => {
                return Err(ControllerError::Gone(format!("pid {} exited", config.pid)));
            }
            Some(info) if config.start_time != 0 && info.start_time != config.start_time => {
                warn!(
                    pid = config.pid,
                    expected = config.start_time,
                    actual = info.start_time,
                    "Executor pid was reused"
                );
                return Err(ControllerError::Gone(format!(
                    "pid {} belongs to another process",
                    config.pid
                )));
            }
            Some(_) => {}
        }

        info!(pid = config.pid, "Reattached to executor");
        Ok(Box::new(ProcessController::new(
            config.clone(),
            None,
            self.stats_floor,
        )))
    }
}

/// Controller for one executor process.
///
/// A launched controller owns the executor's [`Child`] and can `wait()` on
/// it. A reattached one cannot, and polls liveness instead.
pub struct ProcessController {
    reattach: ReattachConfig,
    child: Mutex<Option<Child>>,
    exited: AtomicBool,
    killed: AtomicBool,
    stats_floor: Duration,
}

impl ProcessController {
    fn new(reattach: ReattachConfig, child: Option<Child>, stats_floor: Duration) -> Self {
        Self {
            reattach,
            child: Mutex::new(child),
            exited: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            stats_floor,
        }
    }

    fn alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire) && is_process_alive(self.reattach.pid)
    }

    async fn poll_until_gone(&self) {
        while is_process_alive(self.reattach.pid) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn kill_group(&self) -> Result<(), ControllerError> {
        let pid = self.reattach.pid;
        info!(pid, "Killing executor process group");
        self.killed.store(true, Ordering::Release);
        match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(ControllerError::Exited),
            Err(e) => Err(e.into()),
        }
    }

    /// Kill whatever is left in the group once the executor is gone.
    ///
    /// Workload descendants the runtime left behind would otherwise outlive
    /// the task. The group may still hold the executor's own zombie.
    fn sweep_group(&self) {
        let pid = self.reattach.pid;
        if !is_group_alive(pid) {
            return;
        }
        debug!(pid, "Sweeping executor process group");
        match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "Failed to kill process group"),
        }
    }
}

#[async_trait]
impl WorkerController for ProcessController {
    fn pid(&self) -> u32 {
        self.reattach.pid
    }

    fn reattach_config(&self) -> ReattachConfig {
        self.reattach.clone()
    }

    async fn wait(&self) -> Result<ProcessState, ControllerError> {
        let pid = self.reattach.pid;
        let child_status = {
            let mut child = self.child.lock().await;
            match child.as_mut() {
                Some(child) => Some(child.wait().await?),
                None => None,
            }
        };
        if child_status.is_none() {
            self.poll_until_gone().await;
        }
        self.exited.store(true, Ordering::Release);
        self.sweep_group();

        if let Some(record) = executor::read_status(&self.reattach.status_file).await? {
            return Ok(ProcessState {
                pid,
                exit_code: record.exit_code,
                signal: record.signal,
                time: record.finished_at,
            });
        }

        // No status file: the executor itself died.
        if let Some(status) = child_status {
            let record = executor::ExitStatusRecord::from_status(status);
            return Ok(ProcessState {
                pid,
                exit_code: record.exit_code,
                signal: record.signal,
                time: record.finished_at,
            });
        }
        if self.killed.load(Ordering::Acquire) {
            return Ok(ProcessState {
                pid,
                exit_code: 0,
                signal: Signal::SIGKILL as i32,
                time: Utc::now(),
            });
        }
        Err(ControllerError::Lost(format!(
            "executor {pid} exited without recording a status"
        )))
    }

    async fn signal(&self, sig: Signal) -> Result<(), ControllerError> {
        if !self.alive() {
            return Err(ControllerError::Exited);
        }
        let pid = Pid::from_raw(self.reattach.pid as i32);
        // The shim cannot forward KILL or STOP; CONT has to reach everything STOP did.
        let sent = if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP | Signal::SIGCONT) {
            debug!(pid = self.reattach.pid, signal = %sig, "Signaling executor process group");
            signal::killpg(pid, sig)
        } else {
            debug!(pid = self.reattach.pid, signal = %sig, "Signaling executor");
            signal::kill(pid, sig)
        };
        match sent {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(ControllerError::Exited),
            Err(e) => Err(e.into()),
        }
    }

    async fn shutdown(&self, sig: Signal, timeout: Duration) -> Result<(), ControllerError> {
        if !self.alive() {
            self.sweep_group();
            return Err(ControllerError::Exited);
        }
        if timeout.is_zero() || sig == Signal::SIGKILL {
            return self.kill_group();
        }

        self.signal(sig).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.alive() {
                self.sweep_group();
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pid = self.reattach.pid, "Timeout waiting for graceful shutdown, killing");
                return match self.kill_group() {
                    Err(ControllerError::Exited) => Ok(()),
                    other => other,
                };
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }

    fn exited(&self) -> bool {
        !self.alive()
    }

    fn stats(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> ReceiverStream<TaskResourceUsage> {
        let (tx, rx) = mpsc::channel(1);
        let pid = self.reattach.pid;
        let interval = interval
            .max(self.stats_floor)
            .max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                sys.refresh_processes_specifics(
                    ProcessesToUpdate::All,
                    true,
                    ProcessRefreshKind::new().with_cpu().with_memory(),
                );
                let Some(sample) = sample_tree(&sys, pid) else {
                    debug!(pid, "Executor gone, ending stats stream");
                    break;
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(sample) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }

    async fn release(&self) {
        let dir = &self.reattach.state_dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Removed executor state"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove executor state"),
        }
    }
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

struct ProcessInfo {
    start_time: u64,
    zombie: bool,
}

fn process_info(pid: u32) -> Option<ProcessInfo> {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::new());
    sys.process(pid).map(|p| ProcessInfo {
        start_time: p.start_time(),
        zombie: p.status() == ProcessStatus::Zombie,
    })
}

fn process_start_time(pid: u32) -> Option<u64> {
    process_info(pid).map(|info| info.start_time)
}

fn is_process_alive(pid: u32) -> bool {
    // Signal 0 only checks existence; zombies still count as existing.
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    process_info(pid).is_some_and(|info| !info.zombie)
}

fn is_group_alive(pgid: u32) -> bool {
    signal::killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

/// Sum CPU and memory over `root` and all of its descendants.
fn sample_tree(sys: &System, root: u32) -> Option<TaskResourceUsage> {
    let root_pid = sysinfo::Pid::from_u32(root);
    let root_process = sys.process(root_pid)?;
    if root_process.status() == ProcessStatus::Zombie {
        return None;
    }

    let mut pids = vec![root_pid];
    let mut i = 0;
    while i < pids.len() {
        let parent = pids[i];
        pids.extend(
            sys.processes()
                .iter()
                .filter(|(_, p)| p.parent() == Some(parent))
                .map(|(pid, _)| *pid),
        );
        i += 1;
    }

    let (cpu_percent, memory_rss_bytes) = pids
        .iter()
        .filter_map(|pid| sys.process(*pid))
        .fold((0f32, 0u64), |(cpu, mem), p| (cpu + p.cpu_usage(), mem + p.memory()));

    Some(TaskResourceUsage {
        timestamp: Utc::now(),
        cpu_percent,
        memory_rss_bytes,
        pids: pids.iter().map(|pid| pid.as_u32()).collect(),
    })
}
