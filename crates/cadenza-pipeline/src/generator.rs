//! Fragment generation
//!
//! Producing a fragment (usually a language-model call) is outside this
//! crate; the pipeline only sees [`FragmentGenerator`]. Two simple
//! generators are provided for the CLI and tests. Both substitute
//! `{{name}}` placeholders with the cycle's parameters.

use async_trait::async_trait;
use cadenza_core::{CadenzaError, CycleParams, Phase, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything a generator knows about the cycle it is producing for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub phase: Phase,
    pub cycle: u32,
    pub parameters: CycleParams,
    /// Set when retrying a blocked cycle
    pub previous_failure: Option<String>,
}

/// Produces the code for one cycle
#[async_trait]
pub trait FragmentGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Replace `{{key}}` with parameter values; unknown keys are left as-is
pub fn render(template: &str, parameters: &CycleParams) -> String {
    parameters
        .iter()
        .fold(template.to_string(), |text, (key, value)| {
            text.replace(&format!("{{{{{}}}}}", key), value)
        })
}

/// Fixed text per phase
#[derive(Debug, Clone, Default)]
pub struct StaticGenerator {
    by_phase: BTreeMap<Phase, String>,
    fallback: Option<String>,
}

impl StaticGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same text for every phase
    pub fn uniform(text: impl Into<String>) -> Self {
        Self {
            by_phase: BTreeMap::new(),
            fallback: Some(text.into()),
        }
    }

    pub fn with_phase(mut self, phase: Phase, text: impl Into<String>) -> Self {
        self.by_phase.insert(phase, text.into());
        self
    }
}

#[async_trait]
impl FragmentGenerator for StaticGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let template = self
            .by_phase
            .get(&request.phase)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                CadenzaError::Generation(format!("no fragment for phase {}", request.phase))
            })?;
        Ok(render(template, &request.parameters))
    }
}

/// Reads `<dir>/<phase>-<cycle>.rb`, falling back to `<dir>/<phase>.rb`
#[derive(Debug, Clone)]
pub struct DirectoryGenerator {
    dir: PathBuf,
}

impl DirectoryGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Candidate files for a request, most specific first
    fn candidates(&self, phase: Phase, cycle: u32) -> [PathBuf; 2] {
        [
            self.dir.join(format!("{}-{}.rb", phase, cycle)),
            self.dir.join(format!("{}.rb", phase)),
        ]
    }
}

#[async_trait]
impl FragmentGenerator for DirectoryGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        for path in self.candidates(request.phase, request.cycle) {
            match tokio::fs::read_to_string(&path).await {
                Ok(template) => {
                    debug!(path = %path.display(), "Fragment loaded");
                    return Ok(render(&template, &request.parameters));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CadenzaError::Generation(format!(
                        "{}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(CadenzaError::Generation(format!(
            "no {}-{}.rb or {}.rb in {}",
            request.phase,
            request.cycle,
            request.phase,
            self.dir.display()
        )))
    }
}
