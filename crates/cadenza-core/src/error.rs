//! Unified error types for Cadenza

use thiserror::Error;

/// Unified error type for all Cadenza operations
#[derive(Error, Debug)]
pub enum CadenzaError {
    // Wire errors
    #[error("OSC codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to bind feedback listener: {0}")]
    Bind(String),

    // Dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Dispatch record not found: {0}")]
    RecordNotFound(String),

    #[error("Outcome already resolved for {0}")]
    OutcomeResolved(String),

    // Pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Fragment generation failed: {0}")]
    Generation(String),

    // Configuration
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using CadenzaError
pub type Result<T> = std::result::Result<T, CadenzaError>;
