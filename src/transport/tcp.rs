//! TCP reachability probe used at device registration

use crate::transport::traits::ReachabilityProbe;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Probes a host by opening (and immediately dropping) a TCP connection
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl TcpProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self, host: &str, port: u16, deadline: Duration) -> bool {
        match timeout(deadline, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("[PROBE] {}:{} unreachable: {}", host, port, e);
                false
            }
            Err(_) => {
                debug!("[PROBE] {}:{} did not answer within {:?}", host, port, deadline);
                false
            }
        }
    }
}
