//! Command execution over device transports
//!
//! This module handles:
//! - The executor contract shared by every protocol
//! - Static capability gating before any connection is opened
//! - SSH execution (one shell invocation per command)
//! - MQTT execution (publish and wait for a correlated response)

mod executor;
pub mod mqtt;
pub mod ssh;

pub use executor::CommandExecutor;
pub use mqtt::{MqttCommandExecutor, MqttExecutorConfig};
pub use ssh::{SshCommandExecutor, SshExecutorConfig};
