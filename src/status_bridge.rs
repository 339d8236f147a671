use crate::config::BridgeConfig;
use async_trait::async_trait;
use serde::Serialize;
use tokio::net::UdpSocket;

/// What the status LED should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Booting,
    Healthy,
    Failure,
    Waiting,
}

impl Status {
    pub fn color(self) -> &'static str {
        match self {
            Status::Booting => "blue",
            Status::Healthy => "green",
            Status::Failure => "red",
            Status::Waiting => "yellow",
        }
    }
}

#[derive(Serialize)]
struct StatusMessage {
    #[serde(rename = "type")]
    msg_type: &'static str,
    state: Status,
    color: &'static str,
}

pub fn status_message(status: Status) -> String {
    let msg = StatusMessage {
        msg_type: "status",
        state: status,
        color: status.color(),
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

#[async_trait]
pub trait StatusIndicator: Send + Sync {
    async fn show(&self, status: Status);
}

/// Used when no LED helper is configured.
pub struct NoIndicator;

#[async_trait]
impl StatusIndicator for NoIndicator {
    async fn show(&self, status: Status) {
        log::debug!("status: {:?}", status);
    }
}

// The LED helper process listens on a local UDP port; we only ever send to it.
pub struct StatusBridge {
    socket: UdpSocket,
    target_addr: String,
}

impl StatusBridge {
    pub async fn new(config: &BridgeConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(format!("{}:{}", config.local_ip, config.local_port)).await?;
        let target_addr = format!("{}:{}", config.remote_ip, config.remote_port);

        Ok(Self {
            socket,
            target_addr,
        })
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusIndicator for StatusBridge {
    async fn show(&self, status: Status) {
        if let Err(e) = self.send_message(&status_message(status)).await {
            log::warn!("Failed to send status to LED helper: {}", e);
        }
    }
}
