//! SSH command executor

use super::executor::{check_gates, CommandExecutor};
use crate::transport::{SshConnector, SshTarget, TransportError};
use async_trait::async_trait;
use fleet_shared::capability::{self, AuthMethod};
use fleet_shared::{Command, Device, ExecutionResult, Protocol};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Settings for SSH execution
#[derive(Debug, Clone)]
pub struct SshExecutorConfig {
    /// User to log in as unless the device overrides it
    pub default_username: String,
    /// Session ready-timeout
    pub ready_timeout: Duration,
}

impl Default for SshExecutorConfig {
    fn default() -> Self {
        Self {
            default_username: "pi".into(),
            ready_timeout: Duration::from_millis(fleet_shared::limits::SSH_READY_TIMEOUT_MS),
        }
    }
}

/// Runs commands through one non-interactive shell invocation per command
pub struct SshCommandExecutor {
    connector: Arc<dyn SshConnector>,
    config: SshExecutorConfig,
}

impl SshCommandExecutor {
    /// Create an executor around an injected connector
    pub fn new(connector: Arc<dyn SshConnector>, config: SshExecutorConfig) -> Self {
        Self { connector, config }
    }

    /// Session target for a device: preferred address, declared port and auth
    fn target(&self, device: &Device) -> Option<SshTarget> {
        let host = device.preferred_address()?;
        let caps = &device.capabilities;
        let auth_methods = caps
            .ssh()
            .map(|s| s.auth_methods.clone())
            .unwrap_or_else(|| vec![AuthMethod::PublicKey]);

        Some(SshTarget {
            host: host.to_string(),
            port: caps.ssh_port(),
            username: device
                .ssh_username
                .clone()
                .unwrap_or_else(|| self.config.default_username.clone()),
            auth_methods,
        })
    }
}

#[async_trait]
impl CommandExecutor for SshCommandExecutor {
    fn name(&self) -> &'static str {
        "SSH"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    fn can_handle(&self, device: &Device) -> bool {
        capability::can_handle(Protocol::Ssh, device)
    }

    async fn execute(&self, device: &Device, command: &Command) -> ExecutionResult {
        if let Some(rejection) = check_gates(self, device, command) {
            return rejection;
        }

        let Some(target) = self.target(device) else {
            return ExecutionResult::rejected(format!(
                "Device {} has no usable address",
                device.id
            ));
        };

        let command_line = command.shell_line();
        let ready_timeout = self.config.ready_timeout;
        let started = Instant::now();

        info!(
            "[SSH] {} on {} via {}:{}",
            command_line, device.id, target.host, target.port
        );

        // Connectors honour the timeout themselves; the outer bound covers ones that don't
        let connect = self.connector.connect(&target, ready_timeout);
        let mut session = match timeout(ready_timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(TransportError::Timeout(_))) | Err(_) => {
                warn!(
                    "[SSH] {} did not become ready within {:?}",
                    target.host, ready_timeout
                );
                return ExecutionResult::timeout(
                    Some(Protocol::Ssh),
                    format!(
                        "SSH connection to {} timed out after {:?}",
                        target.host, ready_timeout
                    ),
                );
            }
            Ok(Err(e)) => {
                warn!("[SSH] connection to {} failed: {}", target.host, e);
                return ExecutionResult::transport_failure(Protocol::Ssh, e.message());
            }
        };

        let result = match session.exec(&command_line).await {
            Ok(out) if out.exit_code == 0 => {
                let mut result = ExecutionResult::completed(Protocol::Ssh, Some(out.stdout), 0);
                result.error = non_empty(out.stderr);
                result
            }
            Ok(out) => {
                let error = non_empty(out.stderr)
                    .unwrap_or_else(|| format!("Command exited with code {}", out.exit_code));
                ExecutionResult::command_failed(
                    Protocol::Ssh,
                    Some(out.stdout),
                    Some(error),
                    out.exit_code,
                )
            }
            Err(TransportError::Timeout(after)) => ExecutionResult::timeout(
                Some(Protocol::Ssh),
                format!("SSH command on {} timed out after {:?}", target.host, after),
            ),
            Err(e) => ExecutionResult::transport_failure(Protocol::Ssh, e.message()),
        };

        if let Err(e) = session.close().await {
            debug!("[SSH] close on {} failed: {}", target.host, e);
        }

        info!(
            "[SSH] {} on {} finished: {} in {:?}",
            command.id,
            device.id,
            result.status,
            started.elapsed()
        );
        result
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
