use crate::config::BridgeConfig;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Pressed,
}

#[derive(Debug, Deserialize)]
struct TriggerMessage {
    #[serde(rename = "type")]
    msg_type: String,
    state: Option<String>,
}

/// `{"type":"button","state":"pressed"}` from the input helper. A missing
/// state counts as a press; releases and other messages are ignored.
pub fn parse_trigger(text: &str) -> Option<TriggerEvent> {
    let msg: TriggerMessage = serde_json::from_str(text.trim()).ok()?;
    if msg.msg_type != "button" {
        return None;
    }
    match msg.state.as_deref() {
        None | Some("pressed") => Some(TriggerEvent::Pressed),
        _ => None,
    }
}

// The button helper process sends datagrams to our local port.
pub struct TriggerBridge {
    socket: UdpSocket,
    tx: mpsc::Sender<TriggerEvent>,
    buffer_size: usize,
}

impl TriggerBridge {
    pub async fn new(config: &BridgeConfig, tx: mpsc::Sender<TriggerEvent>) -> anyhow::Result<Self> {
        let socket =
            UdpSocket::bind(format!("{}:{}", config.local_ip, config.local_port)).await?;

        Ok(Self {
            socket,
            tx,
            buffer_size: config.buffer_size.max(64),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match parse_trigger(msg) {
                Some(event) => {
                    log::info!("Button pressed");
                    if let Err(e) = self.tx.send(event).await {
                        log::error!("Failed to send trigger event: {}", e);
                        break;
                    }
                }
                None => log::debug!("Ignoring input message: {}", msg),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_button_presses_trigger() {
        assert_eq!(
            parse_trigger(r#"{"type":"button","state":"pressed"}"#),
            Some(TriggerEvent::Pressed)
        );
        assert_eq!(parse_trigger(r#"{"type":"button"}"#), Some(TriggerEvent::Pressed));
        assert_eq!(parse_trigger(r#"{"type":"button","state":"released"}"#), None);
        assert_eq!(parse_trigger(r#"{"type":"network","state":"pressed"}"#), None);
        assert_eq!(parse_trigger("pressed"), None);
    }

    #[tokio::test]
    async fn datagram_reaches_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let config = BridgeConfig {
            local_ip: "127.0.0.1".into(),
            local_port: 0,
            remote_ip: String::new(),
            remote_port: 0,
            buffer_size: 256,
        };
        let bridge = TriggerBridge::new(&config, tx).await.unwrap();
        let addr = bridge.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = bridge.run().await;
        });

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"noise", addr).await.unwrap();
        sender
            .send_to(br#"{"type":"button","state":"pressed"}"#, addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(TriggerEvent::Pressed));
    }
}
