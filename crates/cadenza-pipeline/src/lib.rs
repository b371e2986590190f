//! # cadenza-pipeline
//!
//! Phase-tracked generation pipeline for Cadenza.
//!
//! This crate provides:
//! - The pure pipeline state machine (phases, cycles, blocked/cancelled)
//! - Per-phase cycle plans built from configuration
//! - The fragment generator seam and two simple generators
//! - Fragment normalization applied before dispatch
//! - The driver that runs cycles through the command dispatcher

mod generator;
mod normalize;
mod phases;
mod pipeline;
mod state_machine;

pub use generator::{
    render, DirectoryGenerator, FragmentGenerator, GenerationRequest, StaticGenerator,
};
pub use normalize::{fix_sample_paths, fix_sharp_notes, normalize_fragment};
pub use phases::{PhasePlan, PhaseStatus};
pub use pipeline::{CancelHandle, Pipeline, PipelineSnapshot, RetryDecision};
pub use state_machine::{transition, Action, Event, PipelineState, Status};
