//! Shared fixtures for the driver integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::Signal;
use tempfile::TempDir;
use tokio::sync::{Barrier, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use mvirt_wasm::ControllerError;
use mvirt_wasm::config::{DriverConfig, TaskConfig};
use mvirt_wasm::controller::{
    LaunchSpec, ProcessState, ReattachConfig, WorkerController, WorkerLauncher,
};
use mvirt_wasm::driver::Driver;
use mvirt_wasm::types::TaskResourceUsage;

type Outcome = Option<Result<(i32, i32), String>>;

/// A pretend worker process shared by every controller attached to it.
pub struct FakeWorker {
    pub pid: u32,
    pub spec: LaunchSpec,
    outcome: watch::Sender<Outcome>,
    exited: AtomicBool,
    released: AtomicBool,
    signals: Mutex<Vec<Signal>>,
    stats_tasks: AtomicUsize,
}

impl FakeWorker {
    fn new(pid: u32, spec: LaunchSpec) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            pid,
            spec,
            outcome,
            exited: AtomicBool::new(false),
            released: AtomicBool::new(false),
            signals: Mutex::new(Vec::new()),
            stats_tasks: AtomicUsize::new(0),
        }
    }

    fn finish(&self, outcome: Result<(i32, i32), String>) {
        self.exited.store(true, Ordering::Release);
        self.outcome.send_replace(Some(outcome));
    }

    /// The worker exits on its own with `code`.
    pub fn exit(&self, code: i32) {
        self.finish(Ok((code, 0)));
    }

    /// Supervision of the worker breaks down.
    pub fn lose(&self, reason: &str) {
        self.finish(Err(reason.to_string()));
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn was_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    /// Stats sampling tasks still running for this worker.
    pub fn stats_tasks(&self) -> usize {
        self.stats_tasks.load(Ordering::Acquire)
    }
}

pub struct FakeController {
    worker: Arc<FakeWorker>,
}

#[async_trait]
impl WorkerController for FakeController {
    fn pid(&self) -> u32 {
        self.worker.pid
    }

    fn reattach_config(&self) -> ReattachConfig {
        ReattachConfig {
            pid: self.worker.pid,
            start_time: 1_700_000_000,
            status_file: self.worker.spec.state_dir.join("exit.json"),
            state_dir: self.worker.spec.state_dir.clone(),
        }
    }

    async fn wait(&self) -> Result<ProcessState, ControllerError> {
        let mut rx = self.worker.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
            .map_err(|_| ControllerError::Lost("worker dropped".to_string()))?;
        match outcome {
            Some(Ok((exit_code, signal))) => Ok(ProcessState {
                pid: self.worker.pid,
                exit_code,
                signal,
                time: Utc::now(),
            }),
            Some(Err(reason)) => Err(ControllerError::Lost(reason)),
            None => Err(ControllerError::Lost("no outcome".to_string())),
        }
    }

    async fn signal(&self, signal: Signal) -> Result<(), ControllerError> {
        if self.worker.has_exited() {
            return Err(ControllerError::Exited);
        }
        self.worker.signals.lock().unwrap().push(signal);
        Ok(())
    }

    async fn shutdown(&self, signal: Signal, timeout: Duration) -> Result<(), ControllerError> {
        if self.worker.has_exited() {
            return Err(ControllerError::Exited);
        }
        if timeout.is_zero() {
            self.worker.signals.lock().unwrap().push(Signal::SIGKILL);
            self.worker.finish(Ok((0, Signal::SIGKILL as i32)));
        } else {
            self.worker.signals.lock().unwrap().push(signal);
            self.worker.finish(Ok((0, signal as i32)));
        }
        Ok(())
    }

    fn exited(&self) -> bool {
        self.worker.has_exited()
    }

    fn stats(&self, interval: Duration, cancel: CancellationToken) -> ReceiverStream<TaskResourceUsage> {
        let (tx, rx) = mpsc::channel(1);
        let worker = Arc::clone(&self.worker);
        worker.stats_tasks.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if worker.has_exited() {
                    break;
                }
                let sample = TaskResourceUsage {
                    timestamp: Utc::now(),
                    cpu_percent: 1.5,
                    memory_rss_bytes: 4096,
                    pids: vec![worker.pid],
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
            worker.stats_tasks.fetch_sub(1, Ordering::AcqRel);
        });
        ReceiverStream::new(rx)
    }

    async fn release(&self) {
        self.worker.released.store(true, Ordering::Release);
    }
}

/// Launcher that hands out [`FakeWorker`]s instead of processes.
#[derive(Default)]
pub struct FakeLauncher {
    workers: Mutex<HashMap<u32, Arc<FakeWorker>>>,
    next_pid: AtomicU32,
    launches: AtomicUsize,
    reattaches: AtomicUsize,
    fail_launch: AtomicBool,
    launch_gate: Mutex<Option<Arc<Barrier>>>,
    reattach_gate: Mutex<Option<Arc<Barrier>>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        let launcher = Self::default();
        launcher.next_pid.store(1000, Ordering::Relaxed);
        Arc::new(launcher)
    }

    pub fn worker(&self, pid: u32) -> Arc<FakeWorker> {
        Arc::clone(&self.workers.lock().unwrap()[&pid])
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Acquire)
    }

    pub fn reattaches(&self) -> usize {
        self.reattaches.load(Ordering::Acquire)
    }

    pub fn fail_launches(&self) {
        self.fail_launch.store(true, Ordering::Release);
    }

    /// Hold every launch until `n` of them are in flight.
    pub fn hold_launches(&self, n: usize) {
        *self.launch_gate.lock().unwrap() = Some(Arc::new(Barrier::new(n)));
    }

    /// Hold every reattach until `n` of them are in flight.
    pub fn hold_reattaches(&self, n: usize) {
        *self.reattach_gate.lock().unwrap() = Some(Arc::new(Barrier::new(n)));
    }

    /// Every worker launched so far.
    pub fn workers(&self) -> Vec<Arc<FakeWorker>> {
        self.workers.lock().unwrap().values().cloned().collect()
    }
}

async fn pass(gate: &Mutex<Option<Arc<Barrier>>>) {
    let barrier = gate.lock().unwrap().clone();
    if let Some(barrier) = barrier {
        barrier.wait().await;
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerController>, ControllerError> {
        if self.fail_launch.load(Ordering::Acquire) {
            return Err(ControllerError::Spawn("runtime crashed on startup".to_string()));
        }
        self.launches.fetch_add(1, Ordering::AcqRel);

        let pid = self.next_pid.fetch_add(1, Ordering::AcqRel);
        let worker = Arc::new(FakeWorker::new(pid, spec));
        pass(&self.launch_gate).await;
        self.workers.lock().unwrap().insert(pid, Arc::clone(&worker));
        Ok(Box::new(FakeController { worker }))
    }

    async fn reattach(
        &self,
        config: &ReattachConfig,
    ) -> Result<Box<dyn WorkerController>, ControllerError> {
        self.reattaches.fetch_add(1, Ordering::AcqRel);
        pass(&self.reattach_gate).await;
        let worker = self.workers.lock().unwrap().get(&config.pid).cloned();
        match worker {
            Some(worker) if !worker.has_exited() => Ok(Box::new(FakeController { worker })),
            _ => Err(ControllerError::Gone(format!("pid {} not running", config.pid))),
        }
    }
}

/// A driver over `launcher` with its state under a fresh temp dir.
pub fn driver_with(launcher: Arc<FakeLauncher>) -> (Driver, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = DriverConfig {
        runtime_path: PathBuf::from("/opt/wasmtime/bin/wasmtime"),
        data_dir: dir.path().to_path_buf(),
        event_buffer: 16,
        ..Default::default()
    };
    (Driver::new(config, launcher).unwrap(), dir)
}

/// A valid task descriptor for `id`.
pub fn wasm_task(id: &str) -> TaskConfig {
    let mut task = TaskConfig::new(id, format!("{id}-task"));
    task.alloc_id = "alloc-1".to_string();
    task.env.insert("RUST_LOG".to_string(), "debug".to_string());
    task.encode_driver_config(&serde_json::json!({
        "file": "local/hello.wasm",
        "args": ["--name", id],
    }))
    .unwrap();
    task
}
