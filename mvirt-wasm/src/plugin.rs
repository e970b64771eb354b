//! The orchestrator-facing driver contract.
//!
//! [`DriverPlugin`] is what the plugin-serving layer calls into. The task state
//! machine lives below it and does not depend on it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::TaskConfig;
use crate::error::Result;
use crate::events::TaskEvent;
use crate::fingerprint::Fingerprint;
use crate::state::RecoveryHandle;
use crate::types::{ExitResult, TaskResourceUsage, TaskStatus};

pub const PLUGIN_NAME: &str = "wasmtime";
pub const PLUGIN_VERSION: &str = "v0.1.0";
pub const PLUGIN_API_VERSIONS: &[&str] = &["0.1.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Driver,
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub plugin_type: PluginType,
    pub api_versions: Vec<String>,
    pub plugin_version: String,
    pub name: String,
}

impl PluginInfo {
    pub fn wasmtime() -> Self {
        Self {
            plugin_type: PluginType::Driver,
            api_versions: PLUGIN_API_VERSIONS.iter().map(|v| v.to_string()).collect(),
            plugin_version: PLUGIN_VERSION.to_string(),
            name: PLUGIN_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsIsolation {
    None,
    Chroot,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetIsolationMode {
    Host,
    Group,
    Task,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountConfigSupport {
    All,
    None,
}

/// What the driver can do for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub send_signals: bool,
    pub exec: bool,
    pub fs_isolation: FsIsolation,
    pub network_isolation_modes: Vec<NetIsolationMode>,
    pub must_initiate_network: bool,
    pub mount_configs: MountConfigSupport,
}

impl Capabilities {
    pub fn wasmtime() -> Self {
        Self {
            send_signals: true,
            exec: false,
            fs_isolation: FsIsolation::None,
            network_isolation_modes: vec![NetIsolationMode::Host],
            must_initiate_network: false,
            mount_configs: MountConfigSupport::All,
        }
    }
}

/// Result of running a command inside a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_result: ExitResult,
}

/// Lifecycle operations an orchestrator drives.
///
/// Streams returned here close when the given `cancel` token fires or when
/// the driver shuts down.
#[async_trait]
pub trait DriverPlugin: Send + Sync {
    fn plugin_info(&self) -> PluginInfo;

    fn capabilities(&self) -> Capabilities;

    async fn fingerprint(&self, cancel: CancellationToken) -> Result<ReceiverStream<Fingerprint>>;

    /// Start a new task and return the state to persist for recovery.
    async fn start_task(&self, config: TaskConfig) -> Result<RecoveryHandle>;

    /// Reattach to a task started by an earlier driver instance.
    async fn recover_task(&self, handle: &RecoveryHandle) -> Result<()>;

    /// Stream that yields the task's exit result once it is terminal.
    async fn wait_task(&self, id: &str, cancel: CancellationToken) -> Result<ReceiverStream<ExitResult>>;

    async fn stop_task(&self, id: &str, timeout: Duration, signal: &str) -> Result<()>;

    async fn destroy_task(&self, id: &str, force: bool) -> Result<()>;

    async fn inspect_task(&self, id: &str) -> Result<TaskStatus>;

    async fn task_stats(
        &self,
        id: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<TaskResourceUsage>>;

    async fn task_events(&self, cancel: CancellationToken) -> Result<ReceiverStream<TaskEvent>>;

    async fn signal_task(&self, id: &str, signal: &str) -> Result<()>;

    async fn exec_task(&self, id: &str, cmd: &[String], timeout: Duration) -> Result<ExecResult>;

    /// Close every open stream and stop supervising. Workers keep running.
    async fn shutdown(&self);
}
