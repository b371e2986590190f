//! # cadenza-core
//!
//! Core types for the Cadenza code-dispatch pipeline.
//!
//! Cadenza sends generated Sonic Pi fragments to a live-coding engine over a
//! fire-and-forget transport and tracks what came back. This crate holds the
//! vocabulary shared by the bridge and the pipeline:
//!
//! - Fragments, outcomes and dispatch records (the code version log entries)
//! - Phases and cycles of the generation pipeline
//! - Configuration loaded from `.cadenza/config.toml`
//! - The unified error type

mod error;
mod types;

pub mod config;
pub mod fail_open;

pub use config::CadenzaConfig;
pub use error::{CadenzaError, Result};
pub use types::*;
