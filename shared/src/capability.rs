//! Capability Model
//!
//! Per-device declaration of which protocols, commands and restrictions apply,
//! plus the two pure gates every executor runs before touching the network:
//! - `can_handle`: may this protocol be used for this device at all?
//! - `can_execute_command`: may this verb be run on this device?
//!
//! Empty `protocols` or `commands` sets mean "not yet determined" and are
//! treated as unconstrained.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{Device, Protocol};

/// Restriction: only the safe read-only verbs may run
pub const READ_ONLY: &str = "read_only";

/// Restriction: no privileged verbs
pub const NO_SUDO: &str = "no_sudo";

/// Verbs that need elevated privileges on the device
pub const PRIVILEGED_COMMANDS: [&str; 3] = ["reboot", "restart", "update"];

/// Verbs allowed on a read-only device
pub const SAFE_COMMANDS: [&str; 5] = ["status", "info", "ps", "df", "top"];

/// Administrative verbs whose presence justifies keeping a protocol enabled
pub const CORE_COMMANDS: [&str; 5] = ["status", "info", "reboot", "restart", "update"];

/// SSH authentication methods a device accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    KeyboardInteractive,
}

/// SSH-specific capability details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCapability {
    pub supported: bool,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
}

fn default_ssh_port() -> u16 {
    crate::limits::SSH_DEFAULT_PORT
}

impl SshCapability {
    pub fn new(port: u16, auth_methods: Vec<AuthMethod>) -> Self {
        Self {
            supported: true,
            port,
            auth_methods,
        }
    }

    fn unsupported() -> Self {
        Self {
            supported: false,
            port: default_ssh_port(),
            auth_methods: Vec::new(),
        }
    }
}

/// MQTT-specific capability details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttCapability {
    pub supported: bool,
    #[serde(default)]
    pub broker_required: bool,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl MqttCapability {
    pub fn new(broker_required: bool, topics: Vec<String>) -> Self {
        Self {
            supported: true,
            broker_required,
            topics,
        }
    }

    fn unsupported() -> Self {
        Self {
            supported: false,
            broker_required: false,
            topics: Vec::new(),
        }
    }
}

/// Capability profile of one device
///
/// Fields are private so that a protocol marked unsupported can never appear
/// in `protocols`. Persisted blobs that violate this are normalized on load.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "CapabilitiesRecord", rename_all = "camelCase")]
pub struct Capabilities {
    protocols: BTreeSet<Protocol>,
    commands: BTreeSet<String>,
    features: BTreeSet<String>,
    restrictions: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh: Option<SshCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mqtt: Option<MqttCapability>,
}

/// Loose on-disk shape; unknown protocol names are dropped
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CapabilitiesRecord {
    protocols: Vec<String>,
    commands: Vec<String>,
    features: Vec<String>,
    restrictions: Vec<String>,
    ssh: Option<SshCapability>,
    mqtt: Option<MqttCapability>,
}

impl From<CapabilitiesRecord> for Capabilities {
    fn from(record: CapabilitiesRecord) -> Self {
        let mut caps = Capabilities {
            protocols: record
                .protocols
                .iter()
                .filter_map(|p| p.parse().ok())
                .collect(),
            commands: record.commands.into_iter().collect(),
            features: record.features.into_iter().collect(),
            restrictions: record.restrictions.into_iter().collect(),
            ssh: record.ssh,
            mqtt: record.mqtt,
        };
        caps.normalize();
        caps
    }
}

impl Capabilities {
    /// Unconstrained profile
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.enable_protocol(protocol);
        self
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    pub fn with_restriction(mut self, restriction: impl Into<String>) -> Self {
        self.restrictions.insert(restriction.into());
        self
    }

    pub fn with_ssh(mut self, ssh: SshCapability) -> Self {
        self.ssh = Some(ssh);
        self.normalize();
        self
    }

    pub fn with_mqtt(mut self, mqtt: MqttCapability) -> Self {
        self.mqtt = Some(mqtt);
        self.normalize();
        self
    }

    pub fn protocols(&self) -> &BTreeSet<Protocol> {
        &self.protocols
    }

    pub fn commands(&self) -> &BTreeSet<String> {
        &self.commands
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn restrictions(&self) -> &BTreeSet<String> {
        &self.restrictions
    }

    pub fn ssh(&self) -> Option<&SshCapability> {
        self.ssh.as_ref()
    }

    pub fn mqtt(&self) -> Option<&MqttCapability> {
        self.mqtt.as_ref()
    }

    pub fn has_restriction(&self, restriction: &str) -> bool {
        self.restrictions.contains(restriction)
    }

    /// SSH port to connect to, defaulting to 22
    pub fn ssh_port(&self) -> u16 {
        self.ssh.as_ref().map_or(crate::limits::SSH_DEFAULT_PORT, |s| s.port)
    }

    /// True when the protocol-specific block explicitly says unsupported
    pub fn is_protocol_disabled(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Ssh => self.ssh.as_ref().is_some_and(|s| !s.supported),
            Protocol::Mqtt => self.mqtt.as_ref().is_some_and(|m| !m.supported),
        }
    }

    /// Protocol usable as far as the profile knows; an empty list means unknown
    pub fn exposes_protocol(&self, protocol: Protocol) -> bool {
        !self.is_protocol_disabled(protocol)
            && (self.protocols.is_empty() || self.protocols.contains(&protocol))
    }

    /// Add a protocol and mark its block supported. Returns true if changed.
    pub fn enable_protocol(&mut self, protocol: Protocol) -> bool {
        let mut changed = self.protocols.insert(protocol);
        match protocol {
            Protocol::Ssh => {
                if let Some(ssh) = self.ssh.as_mut().filter(|s| !s.supported) {
                    ssh.supported = true;
                    changed = true;
                }
            }
            Protocol::Mqtt => {
                if let Some(mqtt) = self.mqtt.as_mut().filter(|m| !m.supported) {
                    mqtt.supported = true;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Remove a protocol and mark its block unsupported. Returns true if changed.
    pub fn disable_protocol(&mut self, protocol: Protocol) -> bool {
        let mut changed = self.protocols.remove(&protocol);
        match protocol {
            Protocol::Ssh => match self.ssh.as_mut() {
                Some(ssh) if ssh.supported => {
                    ssh.supported = false;
                    changed = true;
                }
                Some(_) => {}
                None => {
                    self.ssh = Some(SshCapability::unsupported());
                    changed = true;
                }
            },
            Protocol::Mqtt => match self.mqtt.as_mut() {
                Some(mqtt) if mqtt.supported => {
                    mqtt.supported = false;
                    changed = true;
                }
                Some(_) => {}
                None => {
                    self.mqtt = Some(MqttCapability::unsupported());
                    changed = true;
                }
            },
        }
        changed
    }

    pub fn add_command(&mut self, verb: &str) -> bool {
        self.commands.insert(verb.to_string())
    }

    pub fn remove_command(&mut self, verb: &str) -> bool {
        self.commands.remove(verb)
    }

    /// Whether the allow-list still holds a core administrative verb
    pub fn has_core_command(&self) -> bool {
        CORE_COMMANDS.iter().any(|v| self.commands.contains(*v))
    }

    /// Check the `supported => listed` invariant
    pub fn is_consistent(&self) -> bool {
        [Protocol::Ssh, Protocol::Mqtt]
            .into_iter()
            .all(|p| !(self.is_protocol_disabled(p) && self.protocols.contains(&p)))
    }

    fn normalize(&mut self) {
        if self.is_protocol_disabled(Protocol::Ssh) {
            self.protocols.remove(&Protocol::Ssh);
        }
        if self.is_protocol_disabled(Protocol::Mqtt) {
            self.protocols.remove(&Protocol::Mqtt);
        }
    }
}

/// Protocol-level gate
///
/// True only if the protocol is not explicitly disabled, the device exposes it
/// (or declares no protocol list at all) and the protocol prerequisite holds:
/// SSH needs a usable address, MQTT needs the device to be `ONLINE`.
pub fn can_handle(protocol: Protocol, device: &Device) -> bool {
    if !device.capabilities.exposes_protocol(protocol) {
        return false;
    }
    match protocol {
        Protocol::Ssh => device.preferred_address().is_some(),
        Protocol::Mqtt => device.is_online(),
    }
}

/// Reason a verb is statically disallowed, `None` if it may run
pub fn command_rejection(verb: &str, caps: &Capabilities) -> Option<String> {
    if !caps.commands.is_empty() && !caps.commands.contains(verb) {
        return Some(format!("Command '{}' is not supported by this device", verb));
    }

    if caps.has_restriction(NO_SUDO) && PRIVILEGED_COMMANDS.contains(&verb) {
        return Some(format!(
            "Command '{}' requires elevated privileges, which this device does not allow ({})",
            verb, NO_SUDO
        ));
    }

    if caps.has_restriction(READ_ONLY) && !SAFE_COMMANDS.contains(&verb) {
        return Some(format!(
            "Command '{}' is not permitted on a read-only device ({})",
            verb, READ_ONLY
        ));
    }

    None
}

/// Command-level gate
pub fn can_execute_command(verb: &str, caps: &Capabilities) -> bool {
    command_rejection(verb, caps).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceClass, DeviceStatus};

    const ALL_VERBS: [&str; 12] = [
        "status", "info", "ps", "df", "top", "reboot", "restart", "update", "logs", "shell",
        "install", "",
    ];

    fn ssh_device(caps: Capabilities) -> Device {
        let mut device = Device::new("dev-1", "bench", DeviceClass::Generic);
        device.ip_address = Some("10.0.0.5".into());
        device.status = DeviceStatus::Online;
        device.capabilities = caps;
        device
    }

    #[test]
    fn test_read_only_allows_exactly_the_safe_set() {
        let caps = Capabilities::new().with_restriction(READ_ONLY);
        for verb in ALL_VERBS {
            assert_eq!(
                can_execute_command(verb, &caps),
                SAFE_COMMANDS.contains(&verb),
                "verb {:?}",
                verb
            );
        }
    }

    #[test]
    fn test_no_sudo_blocks_privileged_even_when_allow_listed() {
        let caps = Capabilities::new()
            .with_commands(["reboot", "restart", "update", "status"])
            .with_restriction(NO_SUDO);
        for verb in PRIVILEGED_COMMANDS {
            assert!(!can_execute_command(verb, &caps));
        }
        assert!(can_execute_command("status", &caps));
    }

    #[test]
    fn test_allow_list_excludes_unknown_verbs() {
        let caps = Capabilities::new().with_commands(["status"]);
        let reason = command_rejection("reboot", &caps).unwrap();
        assert!(reason.contains("not supported by this device"));
        assert!(can_execute_command("status", &caps));
    }

    #[test]
    fn test_empty_profile_is_permissive() {
        let caps = Capabilities::new();
        for verb in ALL_VERBS {
            assert!(can_execute_command(verb, &caps));
        }
        assert!(caps.exposes_protocol(Protocol::Ssh));
        assert!(caps.exposes_protocol(Protocol::Mqtt));
    }

    #[test]
    fn test_ssh_gate_requires_address() {
        let mut device = ssh_device(Capabilities::new().with_protocol(Protocol::Ssh));
        assert!(can_handle(Protocol::Ssh, &device));

        device.ip_address = None;
        assert!(!can_handle(Protocol::Ssh, &device));
    }

    #[test]
    fn test_mqtt_gate_requires_online() {
        let mut device = ssh_device(Capabilities::new().with_protocol(Protocol::Mqtt));
        device.ip_address = None;
        assert!(can_handle(Protocol::Mqtt, &device));
        assert!(!can_handle(Protocol::Ssh, &device));

        device.status = DeviceStatus::Maintenance;
        assert!(!can_handle(Protocol::Mqtt, &device));
    }

    #[test]
    fn test_unsupported_ssh_block_wins_over_protocol_list() {
        let json = r#"{
            "protocols": ["ssh", "mqtt"],
            "ssh": {"supported": false, "port": 22, "authMethods": ["password"]}
        }"#;
        let caps: Capabilities = serde_json::from_str(json).unwrap();
        assert!(caps.is_consistent());
        assert!(!caps.protocols().contains(&Protocol::Ssh));

        let device = ssh_device(caps);
        assert!(!can_handle(Protocol::Ssh, &device));
        assert!(can_handle(Protocol::Mqtt, &device));
    }

    #[test]
    fn test_disable_then_enable_keeps_invariant() {
        let mut caps = Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_ssh(SshCapability::new(2222, vec![AuthMethod::PublicKey]));

        assert!(caps.disable_protocol(Protocol::Ssh));
        assert!(caps.is_consistent());
        assert!(!caps.disable_protocol(Protocol::Ssh), "second disable is a no-op");

        assert!(caps.enable_protocol(Protocol::Ssh));
        assert!(caps.is_consistent());
        assert_eq!(caps.ssh_port(), 2222);
        assert!(!caps.enable_protocol(Protocol::Ssh));
    }

    #[test]
    fn test_json_schema_round_trip() {
        let caps = Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_commands(["status"])
            .with_restriction(READ_ONLY)
            .with_ssh(SshCapability::new(22, vec![AuthMethod::Password]))
            .with_mqtt(MqttCapability::new(true, vec!["commands".into()]));

        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(value["protocols"], serde_json::json!(["ssh"]));
        assert_eq!(value["ssh"]["authMethods"], serde_json::json!(["password"]));
        assert_eq!(value["mqtt"]["brokerRequired"], serde_json::json!(true));

        let back: Capabilities = serde_json::from_value(value).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_unknown_protocols_are_dropped() {
        let caps: Capabilities =
            serde_json::from_str(r#"{"protocols": ["http", "mqtt"], "commands": ["status"]}"#)
                .unwrap();
        assert_eq!(caps.protocols().len(), 1);
        assert!(caps.protocols().contains(&Protocol::Mqtt));
    }
}
