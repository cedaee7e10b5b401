//! Transport trait abstraction for pluggable SSH and MQTT backends
//!
//! Executors never construct transport clients themselves; they receive a
//! connector at construction time and open one session per command.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_shared::AuthMethod;
use thiserror::Error;

/// Errors surfaced by transport implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// The underlying message, without the category prefix
    pub fn message(&self) -> String {
        match self {
            TransportError::Timeout(_) => self.to_string(),
            TransportError::Connect(msg)
            | TransportError::Auth(msg)
            | TransportError::Protocol(msg)
            | TransportError::Io(msg) => msg.clone(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Where and how to open an SSH session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_methods: Vec<AuthMethod>,
}

/// Output of one non-interactive shell invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// An open SSH session
#[async_trait]
pub trait SshSession: Send {
    /// Run one command line and wait for it to exit
    async fn exec(&mut self, command_line: &str) -> Result<ExecOutput, TransportError>;

    /// Close the session
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for SSH sessions
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Open a session, giving up after `ready_timeout`
    async fn connect(
        &self,
        target: &SshTarget,
        ready_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A live broker connection
#[async_trait]
pub trait MqttSession: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Wait for the next inbound publish, `None` when the connection closed
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Factory for broker connections
#[async_trait]
pub trait MqttConnector: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn MqttSession>, TransportError>;

    fn name(&self) -> &'static str;
}

/// Bounded-time reachability check
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, host: &str, port: u16, deadline: Duration) -> bool;
}
