//! Device, command and execution-result types
//!
//! Devices and commands are owned by the fleet registry and the request
//! intake respectively; the orchestrator only reads them and writes back
//! lifecycle fields.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::Capabilities;

/// Transport protocols a command can travel over
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Mqtt,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Protocol::Ssh),
            "mqtt" => Ok(Protocol::Mqtt),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Liveness of a device as last reported by the fleet registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Offline => "OFFLINE",
            DeviceStatus::Maintenance => "MAINTENANCE",
            DeviceStatus::Error => "ERROR",
        };
        f.pad(s)
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(DeviceStatus::Online),
            "OFFLINE" => Ok(DeviceStatus::Offline),
            "MAINTENANCE" => Ok(DeviceStatus::Maintenance),
            "ERROR" => Ok(DeviceStatus::Error),
            other => Err(format!("unknown device status: {}", other)),
        }
    }
}

/// Hardware family used to pick a baseline capability profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    RaspberryPi,
    Jetson,
    BeagleBone,
    OrangePi,
    Esp32,
    /// Anything we have no hand-authored profile for
    #[default]
    #[serde(other)]
    Generic,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::RaspberryPi => "raspberry_pi",
            DeviceClass::Jetson => "jetson",
            DeviceClass::BeagleBone => "beagle_bone",
            DeviceClass::OrangePi => "orange_pi",
            DeviceClass::Esp32 => "esp32",
            DeviceClass::Generic => "generic",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = std::convert::Infallible;

    /// Unrecognised names fall back to `Generic`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let class = match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "raspberry_pi" | "raspberrypi" | "rpi" => DeviceClass::RaspberryPi,
            "jetson" => DeviceClass::Jetson,
            "beagle_bone" | "beaglebone" => DeviceClass::BeagleBone,
            "orange_pi" | "orangepi" => DeviceClass::OrangePi,
            "esp32" => DeviceClass::Esp32,
            _ => DeviceClass::Generic,
        };
        Ok(class)
    }
}

/// A remotely operated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub class: DeviceClass,
    /// Primary LAN address
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Overlay-network (VPN mesh) address, preferred when present
    #[serde(default)]
    pub overlay_ip: Option<String>,
    pub status: DeviceStatus,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Overrides the orchestrator-wide SSH user
    #[serde(default)]
    pub ssh_username: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Create an offline device with no addresses and permissive capabilities
    pub fn new(id: impl Into<String>, name: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class,
            ip_address: None,
            overlay_ip: None,
            status: DeviceStatus::Offline,
            capabilities: Capabilities::default(),
            ssh_username: None,
            updated_at: crate::now(),
        }
    }

    /// Address to open sessions against: overlay first, then primary
    pub fn preferred_address(&self) -> Option<&str> {
        fn usable(addr: &Option<String>) -> Option<&str> {
            addr.as_deref().map(str::trim).filter(|a| !a.is_empty())
        }
        usable(&self.overlay_ip).or_else(|| usable(&self.ip_address))
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }
}

/// Lifecycle of a command, see `state_machine` for legal transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    /// Terminal states are write-once
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Timeout
        )
    }
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(CommandStatus::Pending),
            "RUNNING" => Ok(CommandStatus::Running),
            "COMPLETED" => Ok(CommandStatus::Completed),
            "FAILED" => Ok(CommandStatus::Failed),
            "TIMEOUT" => Ok(CommandStatus::Timeout),
            other => Err(format!("unknown command status: {}", other)),
        }
    }
}

/// A command addressed to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub device_id: String,
    /// The verb, e.g. `status` or `reboot`
    pub command: String,
    #[serde(default)]
    pub arguments: Option<String>,
    pub status: CommandStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    /// Create a new command in `PENDING` state
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        verb: impl Into<String>,
        arguments: Option<String>,
    ) -> Self {
        let now = crate::now();
        Self {
            id: id.into(),
            device_id: device_id.into(),
            command: verb.into(),
            arguments,
            status: CommandStatus::Pending,
            output: None,
            error: None,
            exit_code: None,
            created_at: now,
            executed_at: None,
            updated_at: now,
        }
    }

    /// The verb as used by capability checks
    pub fn verb(&self) -> &str {
        self.command.trim()
    }

    /// Arguments with surrounding whitespace removed, `None` when blank
    pub fn arguments(&self) -> Option<&str> {
        self.arguments
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// `"<command> <arguments>"`, trimmed
    pub fn shell_line(&self) -> String {
        match self.arguments() {
            Some(args) => format!("{} {}", self.verb(), args),
            None => self.verb().to_string(),
        }
    }

    /// Whether a successful run is expected to take the device offline
    pub fn is_disruptive(&self) -> bool {
        matches!(self.verb(), "reboot" | "restart")
    }
}

/// Why a command ended in a non-successful terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Statically disallowed by the protocol or command gate
    Rejected,
    /// No executor could handle the device
    Routing,
    /// Connection, authentication or protocol error
    Transport,
    /// No terminal response within the deadline
    Timeout,
    /// The device ran the command and reported failure
    Command,
    /// Orchestration failed around the executor
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Rejected => "rejected",
            FailureKind::Routing => "routing",
            FailureKind::Transport => "transport",
            FailureKind::Timeout => "timeout",
            FailureKind::Command => "command",
            FailureKind::Internal => "internal",
        };
        f.pad(s)
    }
}

/// Normalized outcome of one executor call
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Always a terminal status
    pub status: CommandStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    /// Set for every non-`COMPLETED` outcome
    pub failure: Option<FailureKind>,
    /// Protocol actually used, `None` when no transport was touched
    pub protocol: Option<Protocol>,
}

impl ExecutionResult {
    pub fn completed(protocol: Protocol, output: Option<String>, exit_code: i32) -> Self {
        Self {
            status: CommandStatus::Completed,
            output,
            error: None,
            exit_code: Some(exit_code),
            failure: None,
            protocol: Some(protocol),
        }
    }

    /// The device executed the command and reported a failure
    pub fn command_failed(
        protocol: Protocol,
        output: Option<String>,
        error: Option<String>,
        exit_code: i32,
    ) -> Self {
        Self {
            status: CommandStatus::Failed,
            output,
            error,
            exit_code: Some(exit_code),
            failure: Some(FailureKind::Command),
            protocol: Some(protocol),
        }
    }

    /// Capability rejection; no network attempt was made
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Rejected, None, message)
    }

    pub fn routing_failure() -> Self {
        Self::failure(FailureKind::Routing, None, "no suitable executor found")
    }

    pub fn transport_failure(protocol: Protocol, message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Transport, Some(protocol), message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Internal, None, message)
    }

    /// Deadline exceeded; no output is kept and the exit code is forced to 1
    pub fn timeout(protocol: Option<Protocol>, message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Timeout,
            output: None,
            error: Some(message.into()),
            exit_code: Some(1),
            failure: Some(FailureKind::Timeout),
            protocol,
        }
    }

    fn failure(kind: FailureKind, protocol: Option<Protocol>, message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            output: None,
            error: Some(message.into()),
            exit_code: None,
            failure: Some(kind),
            protocol,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    /// Outcome usable as capability evidence: `Some(true)` on success,
    /// `Some(false)` when the device itself reported failure
    pub fn capability_evidence(&self) -> Option<(Protocol, bool)> {
        let protocol = self.protocol?;
        match (self.status, self.failure) {
            (CommandStatus::Completed, _) => Some((protocol, true)),
            (CommandStatus::Failed, Some(FailureKind::Command)) => Some((protocol, false)),
            _ => None,
        }
    }
}
