//! Plugin configuration and task descriptors.
//!
//! Three layers of configuration reach the driver:
//! - [`DriverConfig`]: the plugin configuration, fixed before the first task
//!   operation and passed to [`Driver::new`](crate::driver::Driver::new).
//! - [`TaskConfig`]: the orchestrator's task descriptor, carrying the raw
//!   driver-specific settings as JSON bytes.
//! - [`WasmTaskConfig`]: the decoded driver-specific settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bytes escaped when a task id becomes a directory name. `.` is escaped so
/// `.` and `..` cannot come through.
const TASK_DIR_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Default interval between fingerprints.
pub const DEFAULT_FINGERPRINT_PERIOD_SECS: u64 = 30;

/// Plugin configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Runtime binary that executes the guest module.
    pub runtime_path: PathBuf,
    /// Executor shim binary. Defaults to the running executable.
    pub executor_path: Option<PathBuf>,
    /// Directory holding per-task executor state.
    pub data_dir: PathBuf,
    /// Seconds between fingerprints.
    pub fingerprint_period_secs: u64,
    /// Queue size of each task event subscriber.
    pub event_buffer: usize,
    /// Lower bound for stats sampling intervals, in milliseconds.
    pub stats_interval_floor_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            runtime_path: PathBuf::from("wasmtime"),
            executor_path: None,
            data_dir: PathBuf::from("/var/lib/mvirt/wasm"),
            fingerprint_period_secs: DEFAULT_FINGERPRINT_PERIOD_SECS,
            event_buffer: 64,
            stats_interval_floor_ms: 100,
        }
    }
}

impl DriverConfig {
    /// Decode a JSON plugin configuration. Empty input yields the defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config = if bytes.iter().all(u8::is_ascii_whitespace) {
            Self::default()
        } else {
            serde_json::from_slice(bytes)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and decode a JSON plugin configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fingerprint_period_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "fingerprint_period_secs",
                value: "0".to_string(),
            });
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "event_buffer",
                value: "0".to_string(),
            });
        }
        if self.runtime_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("runtime_path"));
        }
        Ok(())
    }

    pub fn fingerprint_period(&self) -> Duration {
        Duration::from_secs(self.fingerprint_period_secs)
    }

    pub fn stats_interval_floor(&self) -> Duration {
        Duration::from_millis(self.stats_interval_floor_ms)
    }

    /// Per-task executor state directory.
    ///
    /// The id is percent-encoded into a single path component, so no id can
    /// name a directory outside `<data_dir>/tasks`.
    pub fn task_state_dir(&self, task_id: &str) -> PathBuf {
        let name = utf8_percent_encode(task_id, TASK_DIR_ESCAPES).to_string();
        self.data_dir.join("tasks").join(name)
    }
}

/// Resources the orchestrator allotted to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_shares: u64,
    pub memory_mb: u64,
}

/// The orchestrator's task descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    pub job_name: String,
    pub alloc_id: String,
    pub env: HashMap<String, String>,
    pub resources: Resources,
    pub task_dir: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    /// Driver-specific settings, JSON encoded.
    pub driver_config: Vec<u8>,
}

impl TaskConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Encode the driver-specific settings into the descriptor.
    pub fn encode_driver_config<T: Serialize>(&mut self, value: &T) -> Result<(), ConfigError> {
        self.driver_config = serde_json::to_vec(value)?;
        Ok(())
    }

    /// Decode the driver-specific settings.
    pub fn decode_driver_config<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        if self.driver_config.is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_slice(&self.driver_config)?)
    }
}

/// Cranelift code generator options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CraneliftOptions {
    pub debug_verifier: bool,
    /// 0 = none, 1 = speed, 2 = speed and size.
    pub optimize: u8,
    pub nan_canonicalization: bool,
}

impl Default for CraneliftOptions {
    fn default() -> Self {
        Self {
            debug_verifier: false,
            optimize: 1,
            nan_canonicalization: false,
        }
    }
}

/// Compiler selection for the guest module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub strategy: String,
    pub cranelift_options: CraneliftOptions,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            strategy: "auto".to_string(),
            cranelift_options: CraneliftOptions::default(),
        }
    }
}

/// A host directory preopened for the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMapping {
    pub host: String,
    pub guest: String,
}

/// Driver-specific task settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmTaskConfig {
    /// Path of the WebAssembly module.
    pub file: String,
    pub args: Vec<String>,
    pub compiler: CompilerConfig,
    pub profiler: Option<String>,
    pub dir_map: Vec<DirMapping>,
}

const STRATEGIES: &[&str] = &["auto", "cranelift", "winch"];
const PROFILERS: &[&str] = &["none", "perfmap", "jitdump", "vtune"];

impl WasmTaskConfig {
    /// Decode and validate the driver settings of a task descriptor.
    pub fn from_task(task: &TaskConfig) -> Result<Self, ConfigError> {
        let config: Self = task.decode_driver_config()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file.trim().is_empty() {
            return Err(ConfigError::Missing("file"));
        }
        if !STRATEGIES.contains(&self.compiler.strategy.as_str()) {
            return Err(ConfigError::Invalid {
                field: "compiler.strategy",
                value: self.compiler.strategy.clone(),
            });
        }
        if self.compiler.cranelift_options.optimize > 2 {
            return Err(ConfigError::Invalid {
                field: "compiler.cranelift_options.optimize",
                value: self.compiler.cranelift_options.optimize.to_string(),
            });
        }
        if let Some(profiler) = &self.profiler {
            if !PROFILERS.contains(&profiler.as_str()) {
                return Err(ConfigError::Invalid {
                    field: "profiler",
                    value: profiler.clone(),
                });
            }
        }
        for mapping in &self.dir_map {
            if mapping.host.is_empty() || mapping.guest.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "dir_map",
                    value: format!("{}::{}", mapping.host, mapping.guest),
                });
            }
        }
        Ok(())
    }

    /// Command line passed to the runtime binary.
    pub fn runtime_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        let cranelift = &self.compiler.cranelift_options;

        let opt_level = match cranelift.optimize {
            0 => "0",
            1 => "2",
            _ => "s",
        };
        args.push("-O".to_string());
        args.push(format!("opt-level={opt_level}"));

        if self.compiler.strategy != "auto" {
            args.push("-C".to_string());
            args.push(format!("compiler={}", self.compiler.strategy));
        }
        if cranelift.debug_verifier {
            args.push("-C".to_string());
            args.push("cranelift-debug-verifier=y".to_string());
        }
        if cranelift.nan_canonicalization {
            args.push("-W".to_string());
            args.push("nan-canonicalization=y".to_string());
        }

        match self.profiler.as_deref() {
            None | Some("none") => {}
            Some(profiler) => args.push(format!("--profile={profiler}")),
        }

        for mapping in &self.dir_map {
            args.push("--dir".to_string());
            args.push(format!("{}::{}", mapping.host, mapping.guest));
        }

        args.push(self.file.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(driver_config: serde_json::Value) -> TaskConfig {
        let mut task = TaskConfig::new("task-1", "say-hi");
        task.encode_driver_config(&driver_config).unwrap();
        task
    }

    #[test]
    fn defaults_apply_when_only_file_is_set() {
        let task = task_with(serde_json::json!({ "file": "add.wasm" }));
        let config = WasmTaskConfig::from_task(&task).unwrap();

        assert_eq!(config.file, "add.wasm");
        assert_eq!(config.compiler.strategy, "auto");
        assert_eq!(config.compiler.cranelift_options, CraneliftOptions::default());
        assert_eq!(config.compiler.cranelift_options.optimize, 1);
        assert!(config.profiler.is_none());
    }

    #[test]
    fn cranelift_strategy_keeps_option_defaults() {
        let task = task_with(serde_json::json!({
            "file": "add.wasm",
            "compiler": { "strategy": "cranelift" }
        }));
        let config = WasmTaskConfig::from_task(&task).unwrap();

        assert_eq!(config.compiler.strategy, "cranelift");
        assert!(!config.compiler.cranelift_options.debug_verifier);
        assert!(!config.compiler.cranelift_options.nan_canonicalization);
    }

    #[test]
    fn missing_file_is_rejected() {
        let task = task_with(serde_json::json!({ "profiler": "none" }));
        let err = WasmTaskConfig::from_task(&task).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("file")));

        let empty = TaskConfig::new("task-2", "empty");
        assert!(matches!(
            WasmTaskConfig::from_task(&empty),
            Err(ConfigError::Missing("file"))
        ));
    }

    #[test]
    fn malformed_driver_config_is_a_decode_error() {
        let mut task = TaskConfig::new("task-3", "broken");
        task.driver_config = b"{not json".to_vec();
        assert!(matches!(
            WasmTaskConfig::from_task(&task),
            Err(ConfigError::Decode(_))
        ));
    }

    #[test]
    fn unknown_strategy_and_profiler_are_rejected() {
        let task = task_with(serde_json::json!({
            "file": "add.wasm",
            "compiler": { "strategy": "llvm" }
        }));
        assert!(matches!(
            WasmTaskConfig::from_task(&task),
            Err(ConfigError::Invalid { field: "compiler.strategy", .. })
        ));

        let task = task_with(serde_json::json!({ "file": "add.wasm", "profiler": "perf" }));
        assert!(matches!(
            WasmTaskConfig::from_task(&task),
            Err(ConfigError::Invalid { field: "profiler", .. })
        ));
    }

    #[test]
    fn runtime_args_render_all_options() {
        let config = WasmTaskConfig {
            file: "/local/app.wasm".to_string(),
            args: vec!["--verbose".to_string()],
            compiler: CompilerConfig {
                strategy: "cranelift".to_string(),
                cranelift_options: CraneliftOptions {
                    debug_verifier: true,
                    optimize: 2,
                    nan_canonicalization: true,
                },
            },
            profiler: Some("perfmap".to_string()),
            dir_map: vec![DirMapping {
                host: "/alloc/data".to_string(),
                guest: "/data".to_string(),
            }],
        };

        assert_eq!(
            config.runtime_args(),
            vec![
                "run",
                "-O",
                "opt-level=s",
                "-C",
                "compiler=cranelift",
                "-C",
                "cranelift-debug-verifier=y",
                "-W",
                "nan-canonicalization=y",
                "--profile=perfmap",
                "--dir",
                "/alloc/data::/data",
                "/local/app.wasm",
                "--verbose",
            ]
        );
    }

    #[test]
    fn runtime_args_minimal() {
        let config = WasmTaskConfig {
            file: "add.wasm".to_string(),
            ..Default::default()
        };
        assert_eq!(config.runtime_args(), vec!["run", "-O", "opt-level=2", "add.wasm"]);
    }

    #[test]
    fn driver_config_defaults_and_validation() {
        let config = DriverConfig::from_json(b"").unwrap();
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.fingerprint_period(), Duration::from_secs(30));

        let config = DriverConfig::from_json(br#"{"runtime_path": "/usr/bin/wasmtime"}"#).unwrap();
        assert_eq!(config.runtime_path, PathBuf::from("/usr/bin/wasmtime"));
        assert_eq!(config.event_buffer, 64);

        assert!(DriverConfig::from_json(br#"{"fingerprint_period_secs": 0}"#).is_err());
        assert!(DriverConfig::from_json(br#"{"event_buffer": 0}"#).is_err());
    }

    #[test]
    fn task_state_dir_is_per_task() {
        let config = DriverConfig {
            data_dir: PathBuf::from("/tmp/wasm"),
            ..Default::default()
        };
        assert_eq!(
            config.task_state_dir("abc"),
            PathBuf::from("/tmp/wasm/tasks/abc")
        );
        assert_eq!(
            config.task_state_dir("web_1-a"),
            PathBuf::from("/tmp/wasm/tasks/web_1-a")
        );
    }

    #[test]
    fn task_state_dir_stays_under_tasks() {
        let config = DriverConfig {
            data_dir: PathBuf::from("/tmp/wasm"),
            ..Default::default()
        };
        let tasks = PathBuf::from("/tmp/wasm/tasks");

        for id in ["..", ".", "../../victim", "/etc", "a/b", "x\\0y", "ünï"] {
            let dir = config.task_state_dir(id);
            assert_eq!(dir.parent(), Some(tasks.as_path()), "{id:?} -> {dir:?}");
            let name = dir.file_name().unwrap().to_str().unwrap();
            assert!(name != "." && name != ".." && !name.contains('/'), "{id:?} -> {name}");
        }
        assert_eq!(
            config.task_state_dir("../../victim"),
            PathBuf::from("/tmp/wasm/tasks/%2E%2E%2F%2E%2E%2Fvictim")
        );
        assert_ne!(config.task_state_dir("a/b"), config.task_state_dir("a%2Fb"));
    }
}
