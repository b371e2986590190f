//! Execution sandbox boundary
//!
//! The real engine is Sonic Pi running [`listen_loop_snippet`]: it evaluates
//! each `/run-code` fragment inside `begin/rescue` and answers with exactly
//! one `/feedback` message. The types here stand in for it in tests and in
//! `cadenza emulate`, honouring the same contract: one reply per fragment at
//! most, never a reply without a fragment.

use async_trait::async_trait;
use cadenza_core::{CadenzaConfig, CadenzaError, Result};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::osc::OscMessage;
use crate::transport::CodeTransport;

/// Ruby the engine must run for dispatches to get feedback
pub fn listen_loop_snippet(config: &CadenzaConfig) -> String {
    let (host, port) = match config.feedback.bind.rsplit_once(':') {
        Some((host, port)) => (reply_host(host), port.to_string()),
        None => ("127.0.0.1".to_string(), "4559".to_string()),
    };
    let run_code = config.engine.run_code_path.trim_start_matches('/');

    format!(
        r#"live_loop :listen do
  use_real_time
  script = sync "/osc*/{run_code}"

  begin
    eval script[0]
    osc_send '{host}', {port}, '{path}', '{token}'
  rescue Exception => e
    osc_send '{host}', {port}, '{path}', e.message
  end
end
"#,
        run_code = run_code,
        host = ruby_quoted(&host),
        port = port,
        path = ruby_quoted(&config.feedback.path),
        token = ruby_quoted(&config.feedback.success_token),
    )
}

/// Address the engine should reply to for a listener bound on `host`
fn reply_host(host: &str) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<std::net::IpAddr>() {
        Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
        _ if bare.is_empty() => "127.0.0.1".to_string(),
        _ => bare.to_string(),
    }
}

/// Body of a single-quoted Ruby string literal
fn ruby_quoted(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "\\'")
}

/// How a sandbox answers one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success,
    /// Runtime failure text (`e.message` in the listen loop)
    Error(String),
    /// Reply lost in transit
    Silence,
}

/// Evaluates fragments in isolation; a failure is a value, never a panic
pub trait Sandbox: Send + Sync {
    fn evaluate(&self, code: &str) -> Reply;
}

impl<F> Sandbox for F
where
    F: Fn(&str) -> Reply + Send + Sync,
{
    fn evaluate(&self, code: &str) -> Reply {
        self(code)
    }
}

/// Answers from a fixed script, then with a fallback reply
pub struct ScriptedSandbox {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    evaluated: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            fallback: Reply::Success,
            evaluated: Mutex::new(Vec::new()),
        }
    }

    /// Same reply to every fragment
    pub fn always(reply: Reply) -> Self {
        Self::new(Vec::new()).with_fallback(reply)
    }

    /// Reply once the script runs out (defaults to success)
    pub fn with_fallback(mut self, fallback: Reply) -> Self {
        self.fallback = fallback;
        self
    }

    /// Every fragment evaluated so far
    pub fn evaluated(&self) -> Vec<String> {
        match self.evaluated.lock() {
            Ok(codes) => codes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sandbox for ScriptedSandbox {
    fn evaluate(&self, code: &str) -> Reply {
        match self.evaluated.lock() {
            Ok(mut codes) => codes.push(code.to_string()),
            Err(poisoned) => poisoned.into_inner().push(code.to_string()),
        }
        let next = match self.replies.lock() {
            Ok(mut replies) => replies.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Addresses and token an engine double needs
#[derive(Debug, Clone)]
pub struct EngineProfile {
    pub run_code_path: String,
    pub feedback_path: String,
    pub success_token: String,
}

impl EngineProfile {
    pub fn from_config(config: &CadenzaConfig) -> Self {
        Self {
            run_code_path: config.engine.run_code_path.clone(),
            feedback_path: config.feedback.path.clone(),
            success_token: config.feedback.success_token.clone(),
        }
    }

    /// Feedback text for a reply, `None` when the reply is lost
    fn payload(&self, reply: Reply) -> Option<String> {
        match reply {
            Reply::Success => Some(self.success_token.clone()),
            Reply::Error(message) => Some(message),
            Reply::Silence => None,
        }
    }
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self::from_config(&CadenzaConfig::default())
    }
}

/// In-process engine: a transport that evaluates what it is sent
///
/// Feedback goes to a channel; wire it to a `ChannelFeedbackSource`.
pub struct SimulatedEngine<S: Sandbox> {
    sandbox: S,
    profile: EngineProfile,
    feedback: mpsc::UnboundedSender<String>,
    latency: Duration,
}

impl<S: Sandbox> SimulatedEngine<S> {
    pub fn new(sandbox: S, profile: EngineProfile, feedback: mpsc::UnboundedSender<String>) -> Self {
        Self {
            sandbox,
            profile,
            feedback,
            latency: Duration::ZERO,
        }
    }

    /// Delay between receiving a fragment and replying
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }
}

#[async_trait]
impl<S: Sandbox> CodeTransport for SimulatedEngine<S> {
    async fn send(&self, message: &OscMessage) -> Result<()> {
        if message.path != self.profile.run_code_path {
            debug!(path = %message.path, "Simulated engine ignoring control message");
            return Ok(());
        }

        let code = message.first_str().unwrap_or_default();
        let Some(payload) = self.profile.payload(self.sandbox.evaluate(code)) else {
            debug!("Simulated engine dropping reply");
            return Ok(());
        };

        let feedback = self.feedback.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            // Listener gone: the reply is lost like any other datagram
            let _ = feedback.send(payload);
        });
        Ok(())
    }

    fn target(&self) -> String {
        "sim://engine".to_string()
    }
}

/// Engine double on a real UDP socket
pub struct UdpLoopbackEngine {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<u64>,
}

impl UdpLoopbackEngine {
    /// Bind `bind` and answer fragments to `feedback_addr`
    pub async fn start<S: Sandbox + 'static>(
        bind: &str,
        sandbox: S,
        profile: EngineProfile,
        feedback_addr: SocketAddr,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| CadenzaError::Bind(format!("engine socket {}: {}", bind, e)))?;
        let addr = socket.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let join = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            let mut evaluated = 0u64;
            info!("Loopback engine listening on {}", addr);

            loop {
                let received = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    received = socket.recv_from(&mut buf) => received,
                };

                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Loopback engine receive failed: {}", e);
                        continue;
                    }
                };

                let message = match OscMessage::decode(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(from = %from, "Loopback engine got unreadable datagram: {}", e);
                        continue;
                    }
                };

                if message.path != profile.run_code_path {
                    info!(path = %message.path, "Loopback engine received control message");
                    continue;
                }

                evaluated += 1;
                let code = message.first_str().unwrap_or_default();
                let Some(payload) = profile.payload(sandbox.evaluate(code)) else {
                    debug!("Loopback engine dropping reply");
                    continue;
                };

                let reply = OscMessage::text(profile.feedback_path.as_str(), payload);
                match reply.encode() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, feedback_addr).await {
                            warn!("Loopback engine reply to {} failed: {}", feedback_addr, e);
                        }
                    }
                    Err(e) => warn!("Loopback engine could not encode reply: {}", e),
                }
            }

            evaluated
        });

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the engine; returns how many fragments it evaluated
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown_tx.send(()).await;
        self.join.await.unwrap_or_default()
    }
}
