//! Device Capability Detector
//!
//! Three jobs:
//! - Class baselines for newly registered devices
//! - A one-shot TCP probe of the SSH port at registration
//! - Adapting a profile from observed command outcomes

use super::profiles;
use crate::transport::ReachabilityProbe;
use fleet_shared::capability::Capabilities;
use fleet_shared::{Command, Device, DeviceClass, Protocol};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CapabilityDetector {
    probe: Arc<dyn ReachabilityProbe>,
    probe_timeout: Duration,
}

impl CapabilityDetector {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
        }
    }

    /// Conservative baseline for a device class
    pub fn detect_capabilities(&self, class: DeviceClass) -> Capabilities {
        profiles::baseline(class)
    }

    /// Bounded TCP connect against the device's SSH port
    pub async fn probe_reachability(&self, device: &Device) -> bool {
        let Some(host) = device.preferred_address() else {
            debug!("[DETECT] {} has no address to probe", device.id);
            return false;
        };
        let port = device.capabilities.ssh_port();
        let reachable = self
            .probe
            .is_reachable(host, port, self.probe_timeout)
            .await;
        debug!(
            "[DETECT] probe {}:{} for {}: {}",
            host,
            port,
            device.id,
            if reachable { "open" } else { "closed" }
        );
        reachable
    }

    /// Assign the class baseline and, if asked, verify SSH is really there
    ///
    /// An unreachable SSH port removes SSH from the profile. Classes whose
    /// baseline has no SSH are never probed.
    pub async fn register_device(&self, mut device: Device, probe: bool) -> Device {
        device.capabilities = self.detect_capabilities(device.class);

        if probe && device.capabilities.exposes_protocol(Protocol::Ssh) {
            if !self.probe_reachability(&device).await {
                warn!(
                    "[DETECT] SSH unreachable on {}, removing it from the profile",
                    device.id
                );
                device.capabilities.disable_protocol(Protocol::Ssh);
            }
        }

        device.updated_at = fleet_shared::now();
        info!(
            "[DETECT] registered {} as {} with protocols {:?}",
            device.id,
            device.class,
            device.capabilities.protocols()
        );
        device
    }

    /// Fold one observed outcome back into the device profile
    ///
    /// On success the verb and protocol become known-good. On failure the verb
    /// is dropped, and the protocol is disabled once no core administrative
    /// verb is left for it. Unconstrained (empty) lists stay unconstrained.
    /// Applying the same feedback twice changes nothing the second time.
    pub fn reconcile(
        &self,
        device: &Device,
        command: &Command,
        protocol: Protocol,
        success: bool,
    ) -> Capabilities {
        let mut caps = device.capabilities.clone();
        let verb = command.verb();
        if verb.is_empty() {
            return caps;
        }

        if success {
            if !caps.commands().is_empty() && caps.add_command(verb) {
                debug!("[DETECT] {} learned '{}' works", device.id, verb);
            }
            let listed = caps.protocols().contains(&protocol);
            if (!caps.protocols().is_empty() || caps.is_protocol_disabled(protocol))
                && !listed
                && caps.enable_protocol(protocol)
            {
                info!(
                    "[DETECT] {} re-enabled {} after a success",
                    device.id, protocol
                );
            }
            return caps;
        }

        if caps.commands().is_empty() {
            return caps;
        }
        if caps.remove_command(verb) {
            debug!("[DETECT] {} dropped '{}' after a failure", device.id, verb);
        }
        if !caps.has_core_command() && caps.disable_protocol(protocol) {
            warn!(
                "[DETECT] {} has no working core command left, disabling {}",
                device.id, protocol
            );
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::StaticProbe;
    use fleet_shared::capability::{AuthMethod, SshCapability};
    use fleet_shared::DeviceStatus;

    fn detector(reachable: bool) -> (CapabilityDetector, Arc<StaticProbe>) {
        let probe = StaticProbe::new(reachable);
        (
            CapabilityDetector::new(probe.clone(), Duration::from_secs(5)),
            probe,
        )
    }

    fn addressed(class: DeviceClass) -> Device {
        let mut device = Device::new("dev-1", "bench", class);
        device.ip_address = Some("10.0.0.5".into());
        device.status = DeviceStatus::Online;
        device
    }

    fn with_caps(caps: Capabilities) -> Device {
        let mut device = addressed(DeviceClass::RaspberryPi);
        device.capabilities = caps;
        device
    }

    #[tokio::test]
    async fn test_register_unreachable_downgrades_ssh() {
        let (detector, probe) = detector(false);
        let device = detector
            .register_device(addressed(DeviceClass::RaspberryPi), true)
            .await;

        assert_eq!(probe.calls(), 1);
        assert!(!device.capabilities.protocols().contains(&Protocol::Ssh));
        assert!(device.capabilities.is_protocol_disabled(Protocol::Ssh));
        assert!(device.capabilities.is_consistent());
        assert!(device.capabilities.exposes_protocol(Protocol::Mqtt));
    }

    #[tokio::test]
    async fn test_register_without_probe_keeps_baseline() {
        let (detector, probe) = detector(false);
        let device = detector
            .register_device(addressed(DeviceClass::Generic), false)
            .await;

        assert_eq!(probe.calls(), 0);
        assert_eq!(device.capabilities, profiles::baseline(DeviceClass::Generic));
    }

    #[tokio::test]
    async fn test_register_skips_probe_for_mqtt_only_class() {
        let (detector, probe) = detector(true);
        detector
            .register_device(addressed(DeviceClass::Esp32), true)
            .await;
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_probe_without_address_is_unreachable() {
        let (detector, probe) = detector(true);
        let device = Device::new("dev-1", "bench", DeviceClass::Jetson);
        assert!(!detector.probe_reachability(&device).await);
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn test_success_learns_verb() {
        let (detector, _) = detector(true);
        let device = with_caps(
            Capabilities::new()
                .with_protocol(Protocol::Ssh)
                .with_commands(["status"]),
        );
        let cmd = Command::new("c1", "dev-1", "uptime", None);

        let caps = detector.reconcile(&device, &cmd, Protocol::Ssh, true);
        assert!(caps.commands().contains("uptime"));
        assert!(caps.commands().contains("status"));
    }

    #[test]
    fn test_success_reenables_protocol() {
        let (detector, _) = detector(true);
        let mut caps = Capabilities::new()
            .with_protocol(Protocol::Mqtt)
            .with_commands(["status"]);
        caps.disable_protocol(Protocol::Ssh);
        let device = with_caps(caps);
        let cmd = Command::new("c1", "dev-1", "status", None);

        let caps = detector.reconcile(&device, &cmd, Protocol::Ssh, true);
        assert!(caps.protocols().contains(&Protocol::Ssh));
        assert!(!caps.is_protocol_disabled(Protocol::Ssh));
        assert!(caps.is_consistent());
    }

    #[test]
    fn test_failure_disables_protocol_without_core_verbs() {
        let (detector, _) = detector(true);
        let device = with_caps(
            Capabilities::new()
                .with_protocol(Protocol::Ssh)
                .with_commands(["status", "logs"])
                .with_ssh(SshCapability::new(22, vec![AuthMethod::PublicKey])),
        );
        let cmd = Command::new("c1", "dev-1", "status", None);

        let caps = detector.reconcile(&device, &cmd, Protocol::Ssh, false);
        assert!(!caps.commands().contains("status"));
        assert!(caps.commands().contains("logs"));
        assert!(caps.is_protocol_disabled(Protocol::Ssh));
        assert!(caps.is_consistent());
    }

    #[test]
    fn test_failure_keeps_protocol_with_other_core_verbs() {
        let (detector, _) = detector(true);
        let device = with_caps(
            Capabilities::new()
                .with_protocol(Protocol::Ssh)
                .with_commands(["status", "reboot"]),
        );
        let cmd = Command::new("c1", "dev-1", "reboot", None);

        let caps = detector.reconcile(&device, &cmd, Protocol::Ssh, false);
        assert!(!caps.commands().contains("reboot"));
        assert!(caps.protocols().contains(&Protocol::Ssh));
    }

    #[test]
    fn test_unconstrained_profile_stays_unconstrained() {
        let (detector, _) = detector(true);
        let device = with_caps(Capabilities::new());
        let cmd = Command::new("c1", "dev-1", "status", None);

        assert_eq!(
            detector.reconcile(&device, &cmd, Protocol::Ssh, true),
            Capabilities::new()
        );
        assert_eq!(
            detector.reconcile(&device, &cmd, Protocol::Ssh, false),
            Capabilities::new()
        );
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (detector, _) = detector(true);
        let verbs = ["status", "reboot", "logs", "uptime"];
        let start = profiles::baseline(DeviceClass::RaspberryPi);

        for verb in verbs {
            for protocol in [Protocol::Ssh, Protocol::Mqtt] {
                for success in [true, false] {
                    let cmd = Command::new("c1", "dev-1", verb, None);
                    let once =
                        detector.reconcile(&with_caps(start.clone()), &cmd, protocol, success);
                    let twice =
                        detector.reconcile(&with_caps(once.clone()), &cmd, protocol, success);
                    assert_eq!(once, twice, "{} {:?} {}", verb, protocol, success);
                    assert!(once.is_consistent());
                }
            }
        }
    }
}
