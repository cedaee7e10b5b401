//! Orchestrator configuration
//!
//! Layers, lowest first: built-in defaults, optional TOML file, `FLEETD_*`
//! environment variables, CLI flags (applied in `main`).

use crate::command::{MqttExecutorConfig, SshExecutorConfig};
use crate::transport::{BrokerOptions, OpenSshOptions};
use anyhow::{Context, Result};
use fleet_shared::limits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DATABASE: &str = "FLEETD_DATABASE";
pub const ENV_MQTT_HOST: &str = "FLEETD_MQTT_HOST";
pub const ENV_MQTT_PORT: &str = "FLEETD_MQTT_PORT";
pub const ENV_SSH_USER: &str = "FLEETD_SSH_USER";
pub const ENV_SWEEP_INTERVAL: &str = "FLEETD_SWEEP_INTERVAL_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// SQLite database shared by every `fleetd` process
    pub database: PathBuf,
    pub queue: QueueConfig,
    pub ssh: SshConfig,
    pub mqtt: MqttConfig,
    pub probe: ProbeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("fleetd.db"),
            queue: QueueConfig::default(),
            ssh: SshConfig::default(),
            mqtt: MqttConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

/// Sweep scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub sweep_interval_secs: u64,
    /// Hard bound on one executor call
    pub execution_deadline_secs: u64,
    /// Devices processed concurrently within a sweep
    pub max_concurrent_devices: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: limits::SWEEP_INTERVAL_MS / 1000,
            execution_deadline_secs: limits::EXECUTION_DEADLINE_MS / 1000,
            max_concurrent_devices: 8,
        }
    }
}

impl QueueConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn execution_deadline(&self) -> Duration {
        Duration::from_secs(self.execution_deadline_secs.max(1))
    }

    /// Never zero, so a sweep always makes progress
    pub fn concurrency(&self) -> usize {
        self.max_concurrent_devices.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    pub default_username: String,
    pub identity_file: Option<PathBuf>,
    pub strict_host_key_checking: bool,
    pub ready_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".into(),
            default_username: "pi".into(),
            identity_file: None,
            strict_host_key_checking: false,
            ready_timeout_secs: limits::SSH_READY_TIMEOUT_MS / 1000,
            command_timeout_secs: limits::SSH_COMMAND_TIMEOUT_MS / 1000,
        }
    }
}

impl SshConfig {
    pub fn transport_options(&self) -> OpenSshOptions {
        OpenSshOptions {
            binary: self.binary.clone(),
            identity_file: self.identity_file.clone(),
            strict_host_key_checking: self.strict_host_key_checking,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }

    pub fn executor_config(&self) -> SshExecutorConfig {
        SshExecutorConfig {
            default_username: self.default_username.clone(),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub client_id_prefix: String,
    pub response_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: limits::MQTT_DEFAULT_PORT,
            username: None,
            password: None,
            keep_alive_secs: 30,
            client_id_prefix: "fleetd".into(),
            response_timeout_secs: limits::MQTT_RESPONSE_TIMEOUT_MS / 1000,
        }
    }
}

impl MqttConfig {
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            host: self.host.clone(),
            port: self.port,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn executor_config(&self) -> MqttExecutorConfig {
        MqttExecutorConfig {
            client_id_prefix: self.client_id_prefix.clone(),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: limits::PROBE_TIMEOUT_MS,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl OrchestratorConfig {
    /// Defaults, then the file if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `FLEETD_*` overrides from `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATABASE) {
            self.database = PathBuf::from(path);
        }
        if let Some(host) = lookup(ENV_MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(ENV_MQTT_PORT) {
            self.mqtt.port = port.trim().parse().with_context(|| {
                format!("{} must be a port number, got {:?}", ENV_MQTT_PORT, port)
            })?;
        }
        if let Some(user) = lookup(ENV_SSH_USER) {
            self.ssh.default_username = user;
        }
        if let Some(secs) = lookup(ENV_SWEEP_INTERVAL) {
            self.queue.sweep_interval_secs = secs.trim().parse().with_context(|| {
                format!("{} must be a number of seconds, got {:?}", ENV_SWEEP_INTERVAL, secs)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_protocol_limits() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queue.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.queue.execution_deadline(), Duration::from_secs(120));
        assert_eq!(
            config.ssh.executor_config().ready_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(
            config.mqtt.executor_config().response_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(config.probe.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml(
            r#"
            database = "/var/lib/fleetd/fleet.db"

            [mqtt]
            host = "broker.lan"

            [queue]
            max_concurrent_devices = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.database, PathBuf::from("/var/lib/fleetd/fleet.db"));
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.queue.concurrency(), 2);
        assert_eq!(config.queue.sweep_interval_secs, 60);
        assert_eq!(config.ssh.default_username, "pi");
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            (ENV_DATABASE, "/tmp/fleet.db"),
            (ENV_MQTT_HOST, "10.0.0.2"),
            (ENV_MQTT_PORT, "8883"),
            (ENV_SSH_USER, "ops"),
            (ENV_SWEEP_INTERVAL, "15"),
        ]
        .into_iter()
        .collect();

        let mut config = OrchestratorConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database, PathBuf::from("/tmp/fleet.db"));
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.ssh.default_username, "ops");
        assert_eq!(config.queue.sweep_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_bad_env_port_is_an_error() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_env(|k| (k == ENV_MQTT_PORT).then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MQTT_PORT));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let queue = QueueConfig {
            max_concurrent_devices: 0,
            ..Default::default()
        };
        assert_eq!(queue.concurrency(), 1);
    }

    #[test]
    fn test_unknown_tables_are_ignored() {
        let config = OrchestratorConfig::from_toml("[dashboard]\nport = 8080\n").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }
}
