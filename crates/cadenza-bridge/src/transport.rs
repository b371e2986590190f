//! Datagram transport to the live-coding engine

use async_trait::async_trait;
use cadenza_core::config::EngineConfig;
use cadenza_core::{CadenzaError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument};

use crate::osc::OscMessage;

/// Trait for sending messages to the engine (allows mocking in tests)
///
/// Sends are fire-and-forget: `Ok` means the datagram left this process,
/// not that anything received it.
#[async_trait]
pub trait CodeTransport: Send + Sync {
    async fn send(&self, message: &OscMessage) -> Result<()>;

    /// Human-readable destination, for logs
    fn target(&self) -> String;
}

/// Real UDP transport
pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    /// Resolve the engine address from config and bind an ephemeral socket
    ///
    /// IPv4 results are preferred: Sonic Pi listens on IPv4 only, and
    /// `localhost` often resolves to `::1` first.
    pub async fn connect(engine: &EngineConfig) -> Result<Self> {
        let address = engine.address();
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| CadenzaError::Transport(format!("Failed to resolve {}: {}", address, e)))?
            .collect();
        let target = prefer_ipv4(&candidates)
            .ok_or_else(|| CadenzaError::Transport(format!("No address for {}", address)))?;
        Self::to_addr(target).await
    }

    /// Bind an ephemeral socket sending to a fixed address
    pub async fn to_addr(target: SocketAddr) -> Result<Self> {
        let local = if target.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await.map_err(|e| {
            CadenzaError::Transport(format!("Failed to bind sending socket: {}", e))
        })?;
        Ok(Self { socket, target })
    }

    pub fn target_addr(&self) -> SocketAddr {
        self.target
    }
}

fn prefer_ipv4(candidates: &[SocketAddr]) -> Option<SocketAddr> {
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
}

#[async_trait]
impl CodeTransport for UdpTransport {
    #[instrument(skip(self, message), fields(engine = %self.target, path = %message.path))]
    async fn send(&self, message: &OscMessage) -> Result<()> {
        let datagram = message.encode()?;
        let sent = self
            .socket
            .send_to(&datagram, self.target)
            .await
            .map_err(|e| CadenzaError::Transport(format!("send to {} failed: {}", self.target, e)))?;
        debug!(bytes = sent, "Datagram sent");
        Ok(())
    }

    fn target(&self) -> String {
        self.target.to_string()
    }
}

/// Mock transport for testing
///
/// Records every message and optionally forwards it to a channel so a test
/// can play the engine's part.
#[derive(Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<OscMessage>>>,
    forward: Option<mpsc::UnboundedSender<OscMessage>>,
    fail_sends: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that forwards each sent message to the returned receiver
    pub fn forwarding() -> (Self, mpsc::UnboundedReceiver<OscMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            forward: Some(tx),
            ..Self::default()
        };
        (transport, rx)
    }

    /// Make subsequent sends fail locally (e.g. unreachable network)
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Messages sent so far
    pub async fn sent(&self) -> Vec<OscMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl CodeTransport for MockTransport {
    async fn send(&self, message: &OscMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CadenzaError::Transport("mock send failure".to_string()));
        }
        self.sent.lock().await.push(message.clone());
        if let Some(forward) = &self.forward {
            // Receiver gone means the test stopped playing the engine; same as loss
            let _ = forward.send(message.clone());
        }
        Ok(())
    }

    fn target(&self) -> String {
        "mock://engine".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_address_is_preferred() {
        let v6: SocketAddr = "[::1]:4560".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:4560".parse().unwrap();

        assert_eq!(prefer_ipv4(&[v6, v4]), Some(v4));
        assert_eq!(prefer_ipv4(&[v6]), Some(v6));
        assert_eq!(prefer_ipv4(&[]), None);
    }

    #[tokio::test]
    async fn test_mock_records_and_forwards() {
        let (transport, mut rx) = MockTransport::forwarding();
        transport
            .send(&OscMessage::run_code("/run-code", "play 60"))
            .await
            .unwrap();

        assert_eq!(transport.sent().await.len(), 1);
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.first_str(), Some("play 60"));
    }

    #[tokio::test]
    async fn test_mock_failing_sends() {
        let transport = MockTransport::new();
        transport.set_failing(true);
        let result = transport.send(&OscMessage::stop_recording()).await;
        assert!(matches!(result, Err(CadenzaError::Transport(_))));
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_udp_transport_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::to_addr(receiver.local_addr().unwrap())
            .await
            .unwrap();

        transport
            .send(&OscMessage::run_code("/run-code", "play :e2"))
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let msg = OscMessage::decode(&buf[..len]).unwrap();
        assert_eq!(msg.path, "/run-code");
        assert_eq!(msg.first_str(), Some("play :e2"));
    }

    #[tokio::test]
    async fn test_connect_resolves_engine_config() {
        let engine = EngineConfig {
            host: "127.0.0.1".to_string(),
            port: 4560,
            run_code_path: "/run-code".to_string(),
        };
        let transport = UdpTransport::connect(&engine).await.unwrap();
        assert_eq!(transport.target(), "127.0.0.1:4560");
    }
}
