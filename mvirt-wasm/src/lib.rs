//! mvirt-wasm - task driver that runs WebAssembly workloads under wasmtime.
//!
//! The [`driver::Driver`] implements [`plugin::DriverPlugin`], the contract an
//! orchestrator agent drives. Workers run under the executor shim
//! ([`executor`]) so they survive a driver restart and can be recovered.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod handle;
pub mod plugin;
pub mod signal;
pub mod state;
pub mod store;
pub mod types;

pub use config::{DriverConfig, TaskConfig, WasmTaskConfig};
pub use driver::Driver;
pub use error::{ConfigError, ControllerError, DriverError, Result};
pub use plugin::DriverPlugin;
pub use state::RecoveryHandle;
pub use types::{ExitResult, TaskState, TaskStatus};
