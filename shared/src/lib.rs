//! Fleet Shared Types
//!
//! This crate provides the device, command and capability types shared by the
//! orchestrator, its transports and any device-side agent speaking the MQTT
//! command protocol.

pub mod capability;
pub mod codec;
pub mod model;
pub mod state_machine;

use chrono::{DateTime, Utc};

// Re-export commonly used types at crate root
pub use capability::{AuthMethod, Capabilities, MqttCapability, SshCapability};
pub use codec::{CommandEnvelope, ResponseEnvelope};
pub use model::{
    Command, CommandStatus, Device, DeviceClass, DeviceStatus, ExecutionResult, FailureKind,
    Protocol,
};

/// Current wall-clock time in UTC
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Deadlines and defaults for the command pipeline
pub mod limits {
    /// Default SSH port when a device declares none
    pub const SSH_DEFAULT_PORT: u16 = 22;

    /// SSH session ready-timeout in milliseconds
    pub const SSH_READY_TIMEOUT_MS: u64 = 10_000;

    /// Upper bound for a single SSH command once the session is up
    pub const SSH_COMMAND_TIMEOUT_MS: u64 = 60_000;

    /// How long an MQTT command waits for a correlated response
    pub const MQTT_RESPONSE_TIMEOUT_MS: u64 = 30_000;

    /// Default MQTT broker port
    pub const MQTT_DEFAULT_PORT: u16 = 1883;

    /// Registration-time reachability probe deadline
    pub const PROBE_TIMEOUT_MS: u64 = 5_000;

    /// Production sweep interval for the queue manager
    pub const SWEEP_INTERVAL_MS: u64 = 60_000;

    /// Queue-level bound around any executor call
    pub const EXECUTION_DEADLINE_MS: u64 = 120_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_ordered() {
        // The queue deadline must outlive every protocol deadline it wraps
        assert!(limits::EXECUTION_DEADLINE_MS > limits::MQTT_RESPONSE_TIMEOUT_MS);
        assert!(limits::EXECUTION_DEADLINE_MS > limits::SSH_COMMAND_TIMEOUT_MS);
        assert!(limits::PROBE_TIMEOUT_MS < limits::SSH_READY_TIMEOUT_MS);
    }
}
