//! Phase plan: how many cycles each phase runs and with which parameters

use cadenza_core::config::PipelineConfig;
use cadenza_core::{CycleParams, Phase};
use std::collections::BTreeMap;

/// Status of a phase within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Blocked(String),
    Completed,
}

/// Per-phase cycle counts and generation parameters
///
/// Every phase of [`Phase::ALL`] is present. A phase with zero cycles is
/// completed as soon as the pipeline reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    cycles: BTreeMap<Phase, u32>,
    parameters: BTreeMap<Phase, CycleParams>,
}

impl PhasePlan {
    /// Same cycle count for every phase
    pub fn uniform(cycles: u32) -> Self {
        Self {
            cycles: Phase::ALL.iter().map(|p| (*p, cycles)).collect(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            cycles: Phase::ALL
                .iter()
                .map(|p| (*p, config.cycles_for(*p)))
                .collect(),
            parameters: Phase::ALL
                .iter()
                .map(|p| (*p, config.parameters_for(*p)))
                .filter(|(_, params)| !params.is_empty())
                .collect(),
        }
    }

    pub fn with_cycles(mut self, phase: Phase, cycles: u32) -> Self {
        self.cycles.insert(phase, cycles);
        self
    }

    pub fn with_parameter(
        mut self,
        phase: Phase,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.parameters
            .entry(phase)
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn cycles_for(&self, phase: Phase) -> u32 {
        self.cycles.get(&phase).copied().unwrap_or(0)
    }

    /// Parameters for one cycle of a phase
    ///
    /// The phase's parameters plus `cycle` (zero-based) and `cycles`, so a
    /// generator can tell where in the phase it is.
    pub fn parameters_for(&self, phase: Phase, cycle: u32) -> CycleParams {
        let mut params = self.parameters.get(&phase).cloned().unwrap_or_default();
        params.insert("cycle".to_string(), cycle.to_string());
        params.insert("cycles".to_string(), self.cycles_for(phase).to_string());
        params
    }

    /// Whether `cycle` is the last one of `phase`
    pub fn is_last_cycle(&self, phase: Phase, cycle: u32) -> bool {
        cycle + 1 >= self.cycles_for(phase)
    }

    /// Total cycles across all phases
    pub fn total_cycles(&self) -> u32 {
        self.cycles.values().sum()
    }
}

impl Default for PhasePlan {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}
