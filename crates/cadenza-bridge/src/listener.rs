//! Always-on feedback listener
//!
//! One task per pipeline, started before the first dispatch. It pulls raw
//! payloads from a source and hands them to the sink without interpreting
//! them. Receive and decode errors are logged; only `shutdown()` or a closed
//! source ends the loop.

use async_trait::async_trait;
use cadenza_core::config::FeedbackConfig;
use cadenza_core::{CadenzaError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::FeedbackSink;
use crate::osc::OscMessage;

/// Largest datagram accepted; error messages with backtraces can be long
const MAX_DATAGRAM: usize = 64 * 1024;

/// Where feedback payloads come from
#[async_trait]
pub trait FeedbackSource: Send + 'static {
    /// Next payload, an error for a bad datagram, or `None` once closed
    async fn next_payload(&mut self) -> Option<Result<String>>;

    fn describe(&self) -> String;
}

/// Bind a UDP socket, retrying while the port is still held elsewhere
pub async fn bind_with_retries(addr: &str, attempts: u32, delay: Duration) -> Result<UdpSocket> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                info!("Feedback listener bound to {}", addr);
                return Ok(socket);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!(
                        "Could not bind {} ({}); retrying in {}ms (attempt {}/{})",
                        addr,
                        e,
                        delay.as_millis(),
                        attempt,
                        attempts
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(CadenzaError::Bind(format!(
        "{} after {} attempts: {}",
        addr, attempts, last_error
    )))
}

/// Feedback arriving as OSC over UDP
pub struct UdpFeedbackSource {
    socket: UdpSocket,
    path: String,
    buf: Vec<u8>,
}

impl UdpFeedbackSource {
    /// Bind the configured feedback address
    pub async fn bind(config: &FeedbackConfig) -> Result<Self> {
        let socket = bind_with_retries(
            &config.bind,
            config.bind_attempts,
            config.bind_retry_delay(),
        )
        .await?;
        Ok(Self::from_socket(socket, &config.path))
    }

    pub fn from_socket(socket: UdpSocket, path: impl Into<String>) -> Self {
        Self {
            socket,
            path: path.into(),
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl FeedbackSource for UdpFeedbackSource {
    async fn next_payload(&mut self) -> Option<Result<String>> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf).await {
                Ok(received) => received,
                Err(e) => {
                    // Avoid spinning on a persistent socket error
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    return Some(Err(CadenzaError::Transport(format!("receive failed: {}", e))));
                }
            };

            let message = match OscMessage::decode(&self.buf[..len]) {
                Ok(message) => message,
                Err(e) => return Some(Err(e)),
            };

            if message.path != self.path {
                debug!(from = %from, path = %message.path, "Ignoring non-feedback message");
                continue;
            }

            return Some(message.first_str().map(str::to_string).ok_or_else(|| {
                CadenzaError::Codec(format!("{} from {} carried no text", self.path, from))
            }));
        }
    }

    fn describe(&self) -> String {
        match self.socket.local_addr() {
            Ok(addr) => format!("udp://{}{}", addr, self.path),
            Err(_) => format!("udp://?{}", self.path),
        }
    }
}

/// In-process feedback, paired with `SimulatedEngine`
pub struct ChannelFeedbackSource {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelFeedbackSource {
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Sender/source pair
    pub fn channel() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl FeedbackSource for ChannelFeedbackSource {
    async fn next_payload(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    fn describe(&self) -> String {
        "channel://feedback".to_string()
    }
}

/// Counters reported when the listener stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub delivered: u64,
    pub errors: u64,
}

/// Control handle for a running listener
pub struct ListenerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<ListenerStats>,
    description: String,
}

impl ListenerHandle {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Stop the listener and wait for it to exit
    pub async fn shutdown(self) -> ListenerStats {
        // Already-exited listeners have dropped the receiver
        let _ = self.shutdown_tx.send(()).await;
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Feedback listener task failed: {}", e);
                ListenerStats::default()
            }
        }
    }
}

/// Spawns the listening task
pub struct FeedbackListener;

impl FeedbackListener {
    pub fn spawn<S: FeedbackSource>(mut source: S, sink: Arc<dyn FeedbackSink>) -> ListenerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let description = source.describe();
        let task_description = description.clone();

        let join = tokio::spawn(async move {
            let mut stats = ListenerStats::default();
            info!("Listening for feedback on {}", task_description);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Feedback listener shutting down");
                        break;
                    }
                    next = source.next_payload() => {
                        match next {
                            Some(Ok(payload)) => {
                                debug!(payload = %payload, "Feedback received");
                                stats.delivered += 1;
                                sink.deliver(payload).await;
                            }
                            Some(Err(e)) => {
                                stats.errors += 1;
                                warn!("Discarding unreadable feedback: {}", e);
                            }
                            None => {
                                info!("Feedback source closed");
                                break;
                            }
                        }
                    }
                }
            }

            stats
        });

        ListenerHandle {
            shutdown_tx,
            join,
            description,
        }
    }
}
