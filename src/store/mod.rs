//! Fleet store contract
//!
//! The registry of devices and commands is shared by every `fleetd`
//! process; this trait is the narrow surface the queue manager needs from it.

mod sqlite;

pub use sqlite::{Snapshot, SqliteStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_shared::capability::Capabilities;
use fleet_shared::{Command, CommandStatus, Device, DeviceStatus, ExecutionResult};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An online device together with its pending commands, oldest first
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub device: Device,
    pub commands: Vec<Command>,
}

/// Fields written when a command changes state
#[derive(Debug, Clone, PartialEq)]
pub struct CommandUpdate {
    pub status: CommandStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub executed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CommandUpdate {
    /// Terminal update carrying an executor outcome
    pub fn from_result(result: &ExecutionResult) -> Self {
        Self {
            status: result.status,
            output: result.output.clone(),
            error: result.error.clone(),
            exit_code: result.exit_code,
            executed_at: None,
            updated_at: fleet_shared::now(),
        }
    }
}

/// Fields written on a device; `None` leaves the field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub status: Option<DeviceStatus>,
    pub capabilities: Option<Capabilities>,
}

impl DeviceUpdate {
    pub fn status(status: DeviceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities: Some(capabilities),
            ..Default::default()
        }
    }
}

/// Persisted registry of devices and commands
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn find_device(&self, id: &str) -> Result<Option<Device>, StoreError>;

    async fn find_command(&self, id: &str) -> Result<Option<Command>, StoreError>;

    /// Devices in `status` that have at least one `PENDING` command
    ///
    /// Batches are ordered by their oldest pending command; commands within a
    /// batch are ordered by creation time.
    async fn find_devices_with_pending_commands(
        &self,
        status: DeviceStatus,
    ) -> Result<Vec<PendingBatch>, StoreError>;

    /// Atomically move a command `PENDING -> RUNNING`, stamping `executed_at`
    ///
    /// Returns false if the command was not `PENDING`; only the caller that
    /// gets `true` may execute it.
    async fn claim_command(
        &self,
        id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically move a command `PENDING -> FAILED` without running it
    ///
    /// Used when a command cannot be routed. Returns false if the command was
    /// no longer `PENDING`, leaving whoever claimed it in charge.
    async fn fail_pending(&self, id: &str, update: CommandUpdate) -> Result<bool, StoreError>;

    /// Apply an update; terminal commands reject every further write
    async fn update_command(&self, id: &str, update: CommandUpdate)
        -> Result<Command, StoreError>;

    async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<Device, StoreError>;
}
