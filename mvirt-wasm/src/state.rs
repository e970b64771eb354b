//! Persisted task state.
//!
//! On a successful start the driver hands the orchestrator a
//! [`RecoveryHandle`]. The orchestrator stores it opaquely and passes it back
//! to [`recover_task`](crate::plugin::DriverPlugin::recover_task) after a
//! driver restart. The driver keeps no copy of its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::controller::ReattachConfig;
use crate::error::{DriverError, Result};
use crate::types::TaskState;

/// Version of [`RecoveryState`] this driver writes and understands.
pub const TASK_HANDLE_VERSION: u32 = 1;

/// Runtime state needed to rebuild a task handle during recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub reattach: ReattachConfig,
    pub task_config: TaskConfig,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
}

/// The token returned to the orchestrator by a start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryHandle {
    pub version: u32,
    pub config: TaskConfig,
    pub state: TaskState,
    driver_state: Vec<u8>,
}

impl RecoveryHandle {
    pub fn new(config: TaskConfig, state: &RecoveryState) -> Result<Self> {
        Ok(Self {
            version: TASK_HANDLE_VERSION,
            config,
            state: TaskState::Running,
            driver_state: bincode::serialize(state)?,
        })
    }

    /// Decode the driver state, rejecting handles from other versions.
    pub fn driver_state(&self) -> Result<RecoveryState> {
        if self.version != TASK_HANDLE_VERSION {
            return Err(DriverError::IncompatibleState {
                found: self.version,
                expected: TASK_HANDLE_VERSION,
            });
        }
        Ok(bincode::deserialize(&self.driver_state)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
