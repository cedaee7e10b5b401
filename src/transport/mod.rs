pub mod mqtt;
pub mod ssh;
pub mod tcp;
pub mod traits;

pub use mqtt::{BrokerOptions, RumqttConnector};
pub use ssh::{OpenSshConnector, OpenSshOptions};
pub use tcp::TcpProbe;
pub use traits::{
    ExecOutput, InboundMessage, MqttConnector, MqttSession, ReachabilityProbe, SshConnector,
    SshSession, SshTarget, TransportError,
};

#[cfg(test)]
pub(crate) mod testing;
