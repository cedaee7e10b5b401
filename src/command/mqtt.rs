//! MQTT command executor
//!
//! Push model: the command is published to the device's command topic and the
//! executor waits on the response topic for an envelope carrying the same id.
//! Every call opens its own broker session and tears it down afterwards.

use super::executor::{check_gates, CommandExecutor};
use crate::transport::{MqttConnector, MqttSession, TransportError};
use async_trait::async_trait;
use fleet_shared::capability;
use fleet_shared::codec::{self, CommandEnvelope, ResponseEnvelope};
use fleet_shared::{Command, Device, ExecutionResult, Protocol};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings for MQTT execution
#[derive(Debug, Clone)]
pub struct MqttExecutorConfig {
    /// Client ids are `{prefix}-{uuid}`
    pub client_id_prefix: String,
    /// How long to wait for a matching response
    pub response_timeout: Duration,
}

impl Default for MqttExecutorConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "fleetd".into(),
            response_timeout: Duration::from_millis(
                fleet_shared::limits::MQTT_RESPONSE_TIMEOUT_MS,
            ),
        }
    }
}

/// Runs commands by publish/await-response over a broker
pub struct MqttCommandExecutor {
    connector: Arc<dyn MqttConnector>,
    config: MqttExecutorConfig,
}

/// How the exchange ended, before mapping to a result
enum Exchange {
    Answered(ResponseEnvelope),
    Closed,
    Failed(TransportError),
}

impl MqttCommandExecutor {
    pub fn new(connector: Arc<dyn MqttConnector>, config: MqttExecutorConfig) -> Self {
        Self { connector, config }
    }

    fn client_id(&self) -> String {
        format!("{}-{}", self.config.client_id_prefix, Uuid::new_v4())
    }

    /// Subscribe, publish, then wait for the first response with our id
    async fn exchange(
        session: &mut dyn MqttSession,
        device_id: &str,
        envelope: &CommandEnvelope,
    ) -> Exchange {
        let response_topic = codec::response_topic(device_id);
        if let Err(e) = session.subscribe(&response_topic).await {
            return Exchange::Failed(e);
        }

        let payload = match codec::encode_command(envelope) {
            Ok(bytes) => bytes,
            Err(e) => return Exchange::Failed(TransportError::Protocol(e.to_string())),
        };
        if let Err(e) = session
            .publish(&codec::command_topic(device_id), payload)
            .await
        {
            return Exchange::Failed(e);
        }

        loop {
            let message = match session.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => return Exchange::Closed,
                Err(e) => return Exchange::Failed(e),
            };
            if message.topic != response_topic {
                continue;
            }
            match codec::decode_response(&message.payload) {
                Ok(response) if response.id == envelope.id => {
                    return Exchange::Answered(response)
                }
                Ok(response) => {
                    debug!(
                        "[MQTT] ignoring response {} while waiting for {}",
                        response.id, envelope.id
                    );
                }
                Err(e) => debug!(
                    "[MQTT] ignoring malformed response on {}: {}",
                    message.topic, e
                ),
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for MqttCommandExecutor {
    fn name(&self) -> &'static str {
        "MQTT"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn can_handle(&self, device: &Device) -> bool {
        capability::can_handle(Protocol::Mqtt, device)
    }

    async fn execute(&self, device: &Device, command: &Command) -> ExecutionResult {
        if let Some(rejection) = check_gates(self, device, command) {
            return rejection;
        }

        let client_id = self.client_id();
        let mut session = match self.connector.connect(&client_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!("[MQTT] broker connection for {} failed: {}", device.id, e);
                return ExecutionResult::transport_failure(Protocol::Mqtt, e.message());
            }
        };

        let envelope = CommandEnvelope::for_command(command);
        info!(
            "[MQTT] publishing {} ({}) to {} as {}",
            command.id,
            command.shell_line(),
            device.id,
            client_id
        );

        let wait = self.config.response_timeout;
        let exchange = timeout(
            wait,
            Self::exchange(session.as_mut(), &device.id, &envelope),
        )
        .await;

        let result = match exchange {
            Ok(Exchange::Answered(response)) if response.success => ExecutionResult::completed(
                Protocol::Mqtt,
                response.output,
                response.exit_code.unwrap_or(0),
            ),
            Ok(Exchange::Answered(response)) => {
                let exit_code = response.exit_code.unwrap_or(1);
                let error = response
                    .error
                    .unwrap_or_else(|| format!("Command exited with code {}", exit_code));
                ExecutionResult::command_failed(
                    Protocol::Mqtt,
                    response.output,
                    Some(error),
                    exit_code,
                )
            }
            Ok(Exchange::Closed) => ExecutionResult::transport_failure(
                Protocol::Mqtt,
                "broker closed the connection before a response arrived",
            ),
            Ok(Exchange::Failed(e)) => {
                ExecutionResult::transport_failure(Protocol::Mqtt, e.message())
            }
            Err(_) => {
                warn!("[MQTT] no response for {} within {:?}", command.id, wait);
                ExecutionResult::timeout(
                    Some(Protocol::Mqtt),
                    format!("No response from device {} within {:?}", device.id, wait),
                )
            }
        };

        if let Err(e) = session.disconnect().await {
            debug!("[MQTT] disconnect of {} failed: {}", client_id, e);
        }

        info!(
            "[MQTT] {} on {} finished: {}",
            command.id, device.id, result.status
        );
        result
    }
}
