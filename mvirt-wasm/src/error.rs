//! Error types for the wasm driver.

use std::io;

use thiserror::Error;

/// Errors surfaced by driver lifecycle operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The task id is not in the task store.
    #[error("task not found: {0}")]
    NotFound(String),

    /// A task with this id was already started.
    #[error("task with id {0:?} already started")]
    AlreadyExists(String),

    /// The task descriptor failed decoding or validation.
    #[error("invalid task config: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The persisted worker could not be reconnected.
    #[error("failed to reattach to executor: {0}")]
    ReattachFailed(#[source] ControllerError),

    /// Destroy without force on a task that is still running.
    #[error("cannot destroy running task {0}")]
    StillRunning(String),

    /// The requested capability is not implemented by this driver.
    #[error("wasmtime driver does not support {0}")]
    Unsupported(&'static str),

    /// Worker shutdown failed while the worker was still alive.
    #[error("executor shutdown failed: {0}")]
    Shutdown(#[source] ControllerError),

    /// Signal delivery failed.
    #[error("failed to signal task: {0}")]
    Signal(#[source] ControllerError),

    /// The worker could not be launched.
    #[error("failed to launch task: {0}")]
    Launch(#[source] ControllerError),

    /// The persisted handle was produced by an incompatible driver version.
    #[error("incompatible task handle version {found}, expected {expected}")]
    IncompatibleState { found: u32, expected: u32 },

    /// The persisted driver state could not be encoded or decoded.
    #[error("failed to encode task state: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Errors raised at the worker-process controller boundary.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The worker process has already exited.
    #[error("worker process already exited")]
    Exited,

    /// The described worker is gone (dead pid, reused pid or missing state).
    #[error("worker process is gone: {0}")]
    Gone(String),

    /// Supervision lost track of the worker; its exit status is unknown.
    #[error("lost track of worker process: {0}")]
    Lost(String),

    /// The worker failed to come up.
    #[error("worker failed to start: {0}")]
    Spawn(String),

    #[error("system error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while decoding or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to decode driver config: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {field}")]
    Invalid { field: &'static str, value: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
