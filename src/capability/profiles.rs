//! Hand-authored capability baselines per device class
//!
//! These are starting points only; the feedback loop in the detector corrects
//! them as commands succeed or fail on real hardware.

use fleet_shared::capability::{
    AuthMethod, Capabilities, MqttCapability, SshCapability, READ_ONLY,
};
use fleet_shared::limits::SSH_DEFAULT_PORT;
use fleet_shared::{DeviceClass, Protocol};

/// Verbs every Linux board with a full userland runs
const LINUX_COMMANDS: [&str; 9] = [
    "status", "info", "ps", "df", "top", "reboot", "restart", "update", "logs",
];

fn device_topics() -> Vec<String> {
    vec!["commands".into(), "responses".into()]
}

/// Baseline profile for a class
pub fn baseline(class: DeviceClass) -> Capabilities {
    match class {
        DeviceClass::RaspberryPi => Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_protocol(Protocol::Mqtt)
            .with_commands(LINUX_COMMANDS)
            .with_features(["gpio", "i2c", "spi", "camera"])
            .with_ssh(SshCapability::new(
                SSH_DEFAULT_PORT,
                vec![AuthMethod::PublicKey, AuthMethod::Password],
            ))
            .with_mqtt(MqttCapability::new(true, device_topics())),

        DeviceClass::Jetson => Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_protocol(Protocol::Mqtt)
            .with_commands(LINUX_COMMANDS)
            .with_features(["gpio", "camera", "cuda", "tensorrt"])
            .with_ssh(SshCapability::new(
                SSH_DEFAULT_PORT,
                vec![AuthMethod::PublicKey],
            ))
            .with_mqtt(MqttCapability::new(true, device_topics())),

        DeviceClass::BeagleBone => Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_commands(LINUX_COMMANDS)
            .with_features(["gpio", "adc", "pru"])
            .with_ssh(SshCapability::new(
                SSH_DEFAULT_PORT,
                vec![AuthMethod::PublicKey, AuthMethod::Password],
            )),

        DeviceClass::OrangePi => Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_commands(["status", "info", "ps", "df", "top", "reboot", "logs"])
            .with_features(["gpio", "i2c"])
            .with_ssh(SshCapability::new(
                SSH_DEFAULT_PORT,
                vec![AuthMethod::Password, AuthMethod::PublicKey],
            )),

        // Microcontroller firmware: no shell, commands arrive over the broker
        DeviceClass::Esp32 => {
            let mut caps = Capabilities::new()
                .with_protocol(Protocol::Mqtt)
                .with_commands(["status", "info", "reboot", "update"])
                .with_features(["gpio", "wifi", "ota"])
                .with_mqtt(MqttCapability::new(true, device_topics()));
            caps.disable_protocol(Protocol::Ssh);
            caps
        }

        DeviceClass::Generic => Capabilities::new()
            .with_protocol(Protocol::Ssh)
            .with_commands(["status"])
            .with_restriction(READ_ONLY)
            .with_ssh(SshCapability::new(
                SSH_DEFAULT_PORT,
                vec![AuthMethod::Password],
            )),
    }
}
