use crate::config::NetworkConfig;
use crate::error::{StageError, StageResult};
use async_trait::async_trait;
use mac_address::get_mac_address;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

#[async_trait]
pub trait LinkProbe: Send + Sync {
    /// Succeeds once the network is usable, returning the local address.
    async fn check(&self) -> StageResult<SocketAddr>;
}

/// Treats the link as up once a TCP connection to the sensor API host opens.
pub struct TcpLinkProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpLinkProbe {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            host: config.probe_host.clone(),
            port: config.probe_port,
            timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }
}

#[async_trait]
impl LinkProbe for TcpLinkProbe {
    async fn check(&self) -> StageResult<SocketAddr> {
        let target = (self.host.as_str(), self.port);
        let stream = match timeout(self.timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(StageError::Network(format!(
                    "cannot reach {}:{}: {}",
                    self.host, self.port, e
                )))
            }
            Err(_) => {
                return Err(StageError::Network(format!(
                    "{}:{} did not answer within {:?}",
                    self.host, self.port, self.timeout
                )))
            }
        };
        stream
            .local_addr()
            .map_err(|e| StageError::Network(format!("no local address: {}", e)))
    }
}

pub fn log_link_identity(local: &SocketAddr) {
    log::info!("IP address: {}", local.ip());
    match get_mac_address() {
        Ok(Some(mac)) => log::info!("MAC: {}", mac.to_string().to_lowercase()),
        Ok(None) => log::info!("MAC: unknown"),
        Err(e) => log::warn!("Cannot read MAC address: {}", e),
    }
}
