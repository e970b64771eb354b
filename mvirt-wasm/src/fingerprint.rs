//! Driver health and attribute reporting.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ATTR_DETECTED: &str = "driver.wasmtime";
pub const ATTR_RUNTIME: &str = "driver.wasmtime.runtime";
pub const ATTR_VERSION: &str = "driver.wasmtime.version";

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribute {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Bool(v) => write!(f, "{v}"),
            Attribute::Int(v) => write!(f, "{v}"),
            Attribute::Float(v) => write!(f, "{v}"),
            Attribute::String(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Undetected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub attributes: BTreeMap<String, Attribute>,
    pub health: HealthState,
    pub health_description: String,
}

/// Locate the runtime binary. Bare names are searched on `PATH`.
pub fn resolve_runtime(runtime: &Path) -> Option<PathBuf> {
    if runtime.components().count() > 1 {
        return runtime.is_file().then(|| runtime.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(runtime))
        .find(|candidate| candidate.is_file())
}

async fn runtime_version(runtime: &Path) -> Option<String> {
    let output = tokio::time::timeout(VERSION_TIMEOUT, Command::new(runtime).arg("--version").output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        debug!(runtime = %runtime.display(), status = %output.status, "Runtime version check failed");
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

/// Compute one fingerprint for the given runtime binary.
pub async fn build_fingerprint(runtime: &Path) -> Fingerprint {
    let mut attributes = BTreeMap::new();

    let Some(resolved) = resolve_runtime(runtime) else {
        attributes.insert(ATTR_DETECTED.to_string(), Attribute::Bool(false));
        return Fingerprint {
            attributes,
            health: HealthState::Undetected,
            health_description: "runtime binary not found".to_string(),
        };
    };

    attributes.insert(ATTR_DETECTED.to_string(), Attribute::Bool(true));
    attributes.insert(
        ATTR_RUNTIME.to_string(),
        Attribute::String(resolved.display().to_string()),
    );
    match runtime_version(&resolved).await {
        Some(version) => {
            attributes.insert(ATTR_VERSION.to_string(), Attribute::String(version));
        }
        None => warn!(runtime = %resolved.display(), "Could not determine runtime version"),
    }

    Fingerprint {
        attributes,
        health: HealthState::Healthy,
        health_description: "ready".to_string(),
    }
}

/// Periodic fingerprints: the first right away, then one per `period`.
///
/// The stream ends when either `cancel` or `shutdown` fires.
pub fn fingerprint_stream(
    runtime: PathBuf,
    period: Duration,
    cancel: CancellationToken,
    shutdown: CancellationToken,
) -> ReceiverStream<Fingerprint> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        // `interval` panics on a zero period.
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                _ = ticker.tick() => {}
            }

            let fingerprint = build_fingerprint(&runtime).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                sent = tx.send(fingerprint) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Fingerprint stream closed");
    });

    ReceiverStream::new(rx)
}
