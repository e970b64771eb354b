//! Executor shim.
//!
//! The driver never spawns the runtime directly. It spawns `mvirt-wasm
//! executor`, which runs the runtime as its child, forwards catchable
//! signals to it and records the exit status in a file. The shim lives in its
//! own process group, so it outlives a driver crash and a restarted driver
//! can reattach to it and still learn how the workload ended.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Exit status written by the shim once its child is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatusRecord {
    pub exit_code: i32,
    pub signal: i32,
    pub finished_at: DateTime<Utc>,
}

impl ExitStatusRecord {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            exit_code: status.code().unwrap_or(0),
            signal: status.signal().unwrap_or(0),
            finished_at: Utc::now(),
        }
    }

    /// Exit code the shim itself reports, shell style for signals.
    pub fn shim_exit_code(&self) -> i32 {
        if self.signal != 0 {
            128 + self.signal
        } else {
            self.exit_code
        }
    }
}

/// Run `command` to completion, recording its exit status in `status_file`.
pub async fn run(status_file: &Path, command: &[String]) -> io::Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "command is required"))?;

    let mut child = Command::new(program).args(args).spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
    info!(pid, program = %program, "Executor started workload");

    let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();
    for sig in Signal::iterator().filter(|sig| is_forwarded(*sig)) {
        let mut stream = match unix_signal(SignalKind::from_raw(sig as i32)) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(signal = %sig, error = %e, "Cannot forward signal");
                continue;
            }
        };
        let sig_tx = sig_tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if sig_tx.send(sig).is_err() {
                    break;
                }
            }
        });
    }
    drop(sig_tx);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            Some(sig) = sig_rx.recv() => forward(pid, sig),
        }
    };

    let record = ExitStatusRecord::from_status(status);
    info!(pid, exit_code = record.exit_code, signal = record.signal, "Workload exited");

    if let Err(e) = write_status(status_file, &record).await {
        error!(path = %status_file.display(), error = %e, "Failed to write exit status");
        return Err(e);
    }

    Ok(record.shim_exit_code())
}

/// Signals the shim relays to the workload.
///
/// Everything a handler can be installed for, except SIGCHLD (the shim's own
/// child notification) and the synchronous fault signals.
fn is_forwarded(sig: Signal) -> bool {
    !matches!(
        sig,
        Signal::SIGKILL
            | Signal::SIGSTOP
            | Signal::SIGCHLD
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGTRAP
            | Signal::SIGSYS
    )
}

fn forward(pid: u32, sig: Signal) {
    debug!(pid, signal = %sig, "Forwarding signal to workload");
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        warn!(pid, signal = %sig, error = %e, "Failed to forward signal");
    }
}

/// Atomically replace the status file.
pub async fn write_status(path: &Path, record: &ExitStatusRecord) -> io::Result<()> {
    let tmp = temp_path(path);
    let bytes = serde_json::to_vec(record)?;
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Read a status file, `None` if the shim never wrote one.
pub async fn read_status(path: &Path) -> io::Result<Option<ExitStatusRecord>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
