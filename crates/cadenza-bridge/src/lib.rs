//! # cadenza-bridge
//!
//! The asynchronous bridge between the Cadenza pipeline and a live-coding
//! audio engine.
//!
//! This crate provides:
//! - An OSC 1.0 codec for the `/run-code` and `/feedback` messages
//! - UDP transport for fire-and-forget dispatch
//! - The command dispatcher with FIFO feedback correlation, timeouts and retries
//! - The append-only code version log
//! - The always-on feedback listener
//! - Sandbox test doubles standing in for the engine

mod code_log;
mod dispatcher;
mod listener;
mod osc;
mod sandbox;
mod transport;

pub use code_log::CodeVersionLog;
pub use dispatcher::{
    estimate_runtime, CommandDispatcher, DispatchResolution, DispatcherSettings,
    FeedbackDisposition, FeedbackSink, PendingDispatch,
};
pub use listener::{
    bind_with_retries, ChannelFeedbackSource, FeedbackListener, FeedbackSource, ListenerHandle,
    ListenerStats, UdpFeedbackSource,
};
pub use osc::{OscArg, OscMessage};
pub use sandbox::{
    listen_loop_snippet, EngineProfile, Reply, Sandbox, ScriptedSandbox, SimulatedEngine,
    UdpLoopbackEngine,
};
pub use transport::{CodeTransport, MockTransport, UdpTransport};
