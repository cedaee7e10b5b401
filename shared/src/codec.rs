//! MQTT wire codec
//!
//! Commands and responses travel as JSON on per-device topics:
//! ```text
//! devices/{deviceId}/commands   <- CommandEnvelope  {id, command, arguments?, timestamp}
//! devices/{deviceId}/responses  -> ResponseEnvelope {id, success, output?, error?, exitCode?}
//! ```
//!
//! The `id` is the correlation id; QoS 1 may redeliver, so receivers match on it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Command;

/// Maximum payload size (1 MB); larger responses are rejected unparsed
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Topic the device listens on for commands
pub fn command_topic(device_id: &str) -> String {
    format!("devices/{}/commands", device_id)
}

/// Topic the device publishes responses to
pub fn response_topic(device_id: &str) -> String {
    format!("devices/{}/responses", device_id)
}

/// Command published to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CommandEnvelope {
    /// Build the envelope for a stored command, stamped now
    pub fn for_command(command: &Command) -> Self {
        Self {
            id: command.id.clone(),
            command: command.verb().to_string(),
            arguments: command.arguments().map(str::to_string),
            timestamp: crate::now(),
        }
    }
}

/// Response published by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, output: Option<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            output,
            error: None,
            exit_code: Some(0),
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>, exit_code: i32) -> Self {
        Self {
            id: id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            exit_code: Some(exit_code),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    let buf = serde_json::to_vec(value)?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(buf.len()));
    }
    Ok(Bytes::from(buf))
}

fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, CodecError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }
    Ok(serde_json::from_slice(payload)?)
}

pub fn encode_command(envelope: &CommandEnvelope) -> Result<Bytes, CodecError> {
    encode(envelope)
}

pub fn decode_command(payload: &[u8]) -> Result<CommandEnvelope, CodecError> {
    decode(payload)
}

pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Bytes, CodecError> {
    encode(envelope)
}

pub fn decode_response(payload: &[u8]) -> Result<ResponseEnvelope, CodecError> {
    decode(payload)
}
