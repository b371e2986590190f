//! Configuration management for Cadenza
//!
//! Engine and feedback addresses, dispatch timeout/retry policy and the
//! phase plan defaults. Loaded from `.cadenza/config.toml` in the project
//! root; the engine address can be overridden with `SONIC_PI_HOST` and
//! `SONIC_PI_PORT`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::{CadenzaError, CycleParams, Phase, Result};

/// Token the Sonic Pi listen loop sends after a successful `eval`
pub const DEFAULT_SUCCESS_TOKEN: &str = "MusicAgent Code was executed successfully";

/// Project-level Cadenza configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenzaConfig {
    /// Where fragments are sent
    #[serde(default)]
    pub engine: EngineConfig,

    /// Where feedback is received
    #[serde(default)]
    pub feedback: FeedbackConfig,

    /// Timeout and retry policy
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Phase plan defaults
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Live-coding engine address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_host")]
    pub host: String,

    #[serde(default = "default_engine_port")]
    pub port: u16,

    /// OSC path the engine's listen loop syncs on
    #[serde(default = "default_run_code_path")]
    pub run_code_path: String,
}

/// Feedback listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Local address the listener binds to
    #[serde(default = "default_feedback_bind")]
    pub bind: String,

    /// OSC path carrying feedback messages
    #[serde(default = "default_feedback_path")]
    pub path: String,

    /// Payload that classifies a dispatch as succeeded
    #[serde(default = "default_success_token")]
    pub success_token: String,

    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,

    #[serde(default = "default_bind_retry_delay_ms")]
    pub bind_retry_delay_ms: u64,
}

/// Dispatch timeout and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Minimum time to wait for feedback
    #[serde(default = "default_timeout_floor_ms")]
    pub timeout_floor_ms: u64,

    /// Added to the fragment's estimated runtime
    #[serde(default = "default_timeout_grace_ms")]
    pub timeout_grace_ms: u64,

    /// Redispatches allowed after the first attempt of a cycle
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Interval between "still waiting" hints
    #[serde(default = "default_wait_notice_ms")]
    pub wait_notice_ms: u64,
}

/// Phase plan defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Cycle count per phase, keyed by phase name
    #[serde(default = "default_cycles")]
    pub cycles: BTreeMap<String, u32>,

    /// Generation parameters per phase, keyed by phase name
    #[serde(default)]
    pub parameters: BTreeMap<String, CycleParams>,

    /// Rewrite sharp notes and absolute sample paths before dispatch
    #[serde(default = "default_normalize")]
    pub normalize_fragments: bool,
}

// Default value providers
fn default_engine_host() -> String {
    "localhost".to_string()
}

fn default_engine_port() -> u16 {
    4560
}

fn default_run_code_path() -> String {
    "/run-code".to_string()
}

fn default_feedback_bind() -> String {
    "127.0.0.1:4559".to_string()
}

fn default_feedback_path() -> String {
    "/feedback".to_string()
}

fn default_success_token() -> String {
    DEFAULT_SUCCESS_TOKEN.to_string()
}

fn default_bind_attempts() -> u32 {
    3
}

fn default_bind_retry_delay_ms() -> u64 {
    2_000
}

fn default_timeout_floor_ms() -> u64 {
    10_000
}

fn default_timeout_grace_ms() -> u64 {
    5_000
}

fn default_retry_budget() -> u32 {
    2
}

fn default_wait_notice_ms() -> u64 {
    10_000
}

fn default_cycles() -> BTreeMap<String, u32> {
    Phase::ALL
        .iter()
        .map(|phase| {
            let cycles = if *phase == Phase::Generation { 2 } else { 1 };
            (phase.to_string(), cycles)
        })
        .collect()
}

fn default_normalize() -> bool {
    true
}

impl CadenzaConfig {
    /// Load configuration from `.cadenza/config.toml` or use defaults
    ///
    /// Environment overrides are applied in both cases.
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".cadenza/config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                CadenzaError::Config(format!("Failed to parse config file: {}", e))
            })?
        } else {
            Self::default()
        };

        config.apply_overrides(
            std::env::var("SONIC_PI_HOST").ok(),
            std::env::var("SONIC_PI_PORT").ok(),
        )?;
        Ok(config)
    }

    /// Write default configuration to `.cadenza/config.toml`
    pub fn write_default(project_root: &Path) -> Result<()> {
        let config_dir = project_root.join(".cadenza");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default()).map_err(|e| {
            CadenzaError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Apply engine host/port overrides (values of `SONIC_PI_HOST`/`SONIC_PI_PORT`)
    pub fn apply_overrides(&mut self, host: Option<String>, port: Option<String>) -> Result<()> {
        if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
            self.engine.host = host.trim().to_string();
        }
        if let Some(port) = port.filter(|p| !p.trim().is_empty()) {
            self.engine.port = port
                .trim()
                .parse()
                .map_err(|_| CadenzaError::Config(format!("Invalid SONIC_PI_PORT: {}", port)))?;
        }
        Ok(())
    }
}

impl EngineConfig {
    /// `host:port` string for socket address resolution
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FeedbackConfig {
    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }
}

impl DispatchConfig {
    pub fn timeout_floor(&self) -> Duration {
        Duration::from_millis(self.timeout_floor_ms)
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }

    pub fn wait_notice(&self) -> Duration {
        Duration::from_millis(self.wait_notice_ms)
    }

    /// Feedback window for a fragment expected to run for `estimated_runtime`
    pub fn timeout_for(&self, estimated_runtime: Duration) -> Duration {
        estimated_runtime
            .saturating_add(self.timeout_grace())
            .max(self.timeout_floor())
    }
}

impl PipelineConfig {
    /// Configured cycle count for a phase (phases not listed get one cycle)
    pub fn cycles_for(&self, phase: Phase) -> u32 {
        self.cycles.get(&phase.to_string()).copied().unwrap_or(1)
    }

    /// Configured generation parameters for a phase
    pub fn parameters_for(&self, phase: Phase) -> CycleParams {
        self.parameters
            .get(&phase.to_string())
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for CadenzaConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            feedback: FeedbackConfig::default(),
            dispatch: DispatchConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: default_engine_host(),
            port: default_engine_port(),
            run_code_path: default_run_code_path(),
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            bind: default_feedback_bind(),
            path: default_feedback_path(),
            success_token: default_success_token(),
            bind_attempts: default_bind_attempts(),
            bind_retry_delay_ms: default_bind_retry_delay_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_floor_ms: default_timeout_floor_ms(),
            timeout_grace_ms: default_timeout_grace_ms(),
            retry_budget: default_retry_budget(),
            wait_notice_ms: default_wait_notice_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cycles: default_cycles(),
            parameters: BTreeMap::new(),
            normalize_fragments: default_normalize(),
        }
    }
}
