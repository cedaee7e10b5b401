//! Command executor contract shared by every protocol strategy

use async_trait::async_trait;
use fleet_shared::capability::command_rejection;
use fleet_shared::{Command, Device, ExecutionResult, Protocol};
use tracing::info;

/// A protocol-specific strategy for running commands on devices
///
/// `execute` never fails: every error path is folded into a terminal
/// `ExecutionResult`.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &'static str;

    /// Protocol this executor speaks
    fn protocol(&self) -> Protocol;

    /// Protocol-level gate; cheap and synchronous
    fn can_handle(&self, device: &Device) -> bool;

    /// Run one command on one device
    async fn execute(&self, device: &Device, command: &Command) -> ExecutionResult;
}

/// Run both static gates, returning the rejection to report if either fails
///
/// Rejected commands never reach the transport.
pub(crate) fn check_gates(
    executor: &dyn CommandExecutor,
    device: &Device,
    command: &Command,
) -> Option<ExecutionResult> {
    if !executor.can_handle(device) {
        info!(
            "[{}] device {} cannot take {} commands",
            executor.name(),
            device.id,
            executor.protocol()
        );
        return Some(ExecutionResult::rejected(format!(
            "{} is not available for device {}",
            executor.protocol().as_str().to_uppercase(),
            device.id
        )));
    }

    if let Some(reason) = command_rejection(command.verb(), &device.capabilities) {
        info!(
            "[{}] rejected command {} on {}: {}",
            executor.name(),
            command.id,
            device.id,
            reason
        );
        return Some(ExecutionResult::rejected(reason));
    }

    None
}
