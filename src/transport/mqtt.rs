//! MQTT transport backed by rumqttc
//!
//! One broker connection per session; the event loop is driven from
//! `next_message`, so queued subscribe/publish requests are flushed there.

use crate::transport::traits::{InboundMessage, MqttConnector, MqttSession, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Requests buffered between the client handle and its event loop
const REQUEST_CAPACITY: usize = 10;

/// How long a disconnect may take to flush before the socket is dropped
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: fleet_shared::limits::MQTT_DEFAULT_PORT,
            keep_alive: Duration::from_secs(30),
            username: None,
            password: None,
        }
    }
}

/// Connector opening a fresh rumqttc client per command
pub struct RumqttConnector {
    options: BrokerOptions,
}

impl RumqttConnector {
    pub fn new(options: BrokerOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl MqttConnector for RumqttConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn MqttSession>, TransportError> {
        let mut mqtt_options = MqttOptions::new(client_id, &self.options.host, self.options.port);
        mqtt_options.set_keep_alive(self.options.keep_alive);
        mqtt_options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.options.username, &self.options.password) {
            mqtt_options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        debug!(
            "[MQTT] client {} -> {}:{}",
            client_id, self.options.host, self.options.port
        );

        Ok(Box::new(RumqttSession { client, eventloop }))
    }

    fn name(&self) -> &'static str {
        "rumqttc"
    }
}

/// A client handle plus the event loop that drives it
pub struct RumqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl MqttSession for RumqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    return Ok(Some(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(map_connection_error(e)),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        // Drive the loop until the disconnect is on the wire
        let eventloop = &mut self.eventloop;
        let _ = timeout(DISCONNECT_GRACE, async {
            while eventloop.poll().await.is_ok() {}
        })
        .await;
        Ok(())
    }
}

fn map_connection_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::Io(io) => TransportError::Connect(io.to_string()),
        ConnectionError::ConnectionRefused(code) => {
            TransportError::Auth(format!("broker refused connection: {:?}", code))
        }
        ConnectionError::NetworkTimeout => {
            TransportError::Connect("network timeout while connecting to broker".into())
        }
        other => TransportError::Protocol(other.to_string()),
    }
}
