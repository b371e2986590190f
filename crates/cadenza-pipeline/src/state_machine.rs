//! Pure state machine for pipeline control flow
//!
//! This module implements a pure functional state machine with NO I/O.
//! All state transitions are deterministic and testable.
//!
//! Key design principles:
//! - Pure function: transition(state, event, plan) -> (state, actions)
//! - No async, no I/O, no dispatcher access
//! - Invalid transitions leave the state untouched and emit `Rejected`
//! - Completed phases are only ever added, never removed

use cadenza_core::{Cycle, CycleParams, DispatchId, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::phases::{PhasePlan, PhaseStatus};

/// Run status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Running,
    /// Retry budget exhausted; waits for `RetryRequested` or `Cancel`
    Blocked { reason: String },
    Cancelled,
    /// Finalization completed
    Complete,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Blocked { reason } => write!(f, "blocked: {}", reason),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Pipeline state, owned by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub phase: Phase,
    pub completed: BTreeSet<Phase>,
    pub cycle: Cycle,
    pub status: Status,
    /// Finished cycles, oldest first
    pub history: Vec<Cycle>,
}

impl PipelineState {
    /// Initialization, cycle 0, before anything has been requested
    pub fn new(plan: &PhasePlan) -> Self {
        let phase = Phase::first();
        Self {
            phase,
            completed: BTreeSet::new(),
            cycle: Cycle::new(phase, 0, plan.parameters_for(phase, 0)),
            status: Status::Running,
            history: Vec::new(),
        }
    }

    /// Initial state and the actions that get the run going
    ///
    /// Leading phases with zero cycles are completed straight away.
    pub fn start(plan: &PhasePlan) -> (Self, Vec<Action>) {
        let state = Self::new(plan);
        let mut actions = Vec::new();
        if plan.cycles_for(state.phase) > 0 {
            actions.push(state.request_fragment(None));
            return (state, actions);
        }
        let state = enter_next_phase(state, plan, &mut actions);
        (state, actions)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.status, Status::Blocked { .. })
    }

    /// Complete or cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, Status::Complete | Status::Cancelled)
    }

    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        if self.completed.contains(&phase) {
            return PhaseStatus::Completed;
        }
        if phase != self.phase {
            return PhaseStatus::Pending;
        }
        match &self.status {
            Status::Blocked { reason } => PhaseStatus::Blocked(reason.clone()),
            _ => PhaseStatus::InProgress,
        }
    }

    fn request_fragment(&self, previous_failure: Option<String>) -> Action {
        Action::RequestFragment {
            phase: self.phase,
            cycle: self.cycle.index,
            parameters: self.cycle.parameters.clone(),
            previous_failure,
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Current cycle's fragment executed successfully
    CycleSucceeded { ids: Vec<DispatchId> },
    /// Every attempt for the current cycle failed
    CycleExhausted { reason: String, ids: Vec<DispatchId> },
    /// Operator asks to retry a blocked cycle, optionally with new parameters
    RetryRequested { parameters: Option<CycleParams> },
    Cancel,
}

/// Actions to execute as side effects of transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Generate and dispatch the fragment for a cycle
    RequestFragment {
        phase: Phase,
        cycle: u32,
        parameters: CycleParams,
        previous_failure: Option<String>,
    },
    PhaseCompleted { phase: Phase },
    /// Tell the caller the run is blocked
    SurfaceFailure {
        phase: Phase,
        cycle: u32,
        reason: String,
    },
    PipelineComplete,
    PipelineCancelled,
    /// Event not valid in the current state; state unchanged
    Rejected { reason: String },
}

/// Pure state transition function
///
/// Takes current state and event, returns new state and actions to execute.
/// This function is completely deterministic and has no side effects.
///
/// # Invalid Transitions
/// An event the current state cannot handle returns the state unchanged
/// with a single `Rejected` action. This function never panics.
pub fn transition(
    state: PipelineState,
    event: Event,
    plan: &PhasePlan,
) -> (PipelineState, Vec<Action>) {
    match (state.status.clone(), event) {
        (Status::Running, Event::CycleSucceeded { ids }) => {
            let mut state = state;
            let mut actions = Vec::new();
            state.cycle.dispatches.extend(ids);
            state.cycle.complete = true;

            let next_index = state.cycle.index + 1;
            if next_index < plan.cycles_for(state.phase) {
                let parameters = plan.parameters_for(state.phase, next_index);
                let next = Cycle::new(state.phase, next_index, parameters);
                let finished = std::mem::replace(&mut state.cycle, next);
                state.history.push(finished);
                actions.push(state.request_fragment(None));
                return (state, actions);
            }

            let phase = state.phase;
            let finished = state.cycle.clone();
            state.history.push(finished);
            state.completed.insert(phase);
            actions.push(Action::PhaseCompleted { phase });
            let state = enter_next_phase(state, plan, &mut actions);
            (state, actions)
        }

        (Status::Running, Event::CycleExhausted { reason, ids }) => {
            let mut state = state;
            state.cycle.dispatches.extend(ids);
            let action = Action::SurfaceFailure {
                phase: state.phase,
                cycle: state.cycle.index,
                reason: reason.clone(),
            };
            state.status = Status::Blocked { reason };
            (state, vec![action])
        }

        (Status::Blocked { reason }, Event::RetryRequested { parameters }) => {
            let mut state = state;
            if let Some(parameters) = parameters {
                state.cycle.parameters = parameters;
            }
            state.status = Status::Running;
            let action = state.request_fragment(Some(reason));
            (state, vec![action])
        }

        (Status::Running | Status::Blocked { .. }, Event::Cancel) => {
            let mut state = state;
            state.status = Status::Cancelled;
            (state, vec![Action::PipelineCancelled])
        }

        // All other (state, event) pairs
        (status, event) => {
            let reason = format!(
                "{:?} cannot handle {:?} in phase {} cycle {}",
                status, event, state.phase, state.cycle.index
            );
            (state, vec![Action::Rejected { reason }])
        }
    }
}

/// Move past `state.phase`, completing any zero-cycle phases on the way
fn enter_next_phase(
    mut state: PipelineState,
    plan: &PhasePlan,
    actions: &mut Vec<Action>,
) -> PipelineState {
    // Zero-cycle phases at the very start have not been marked yet
    if plan.cycles_for(state.phase) == 0 && state.completed.insert(state.phase) {
        actions.push(Action::PhaseCompleted { phase: state.phase });
    }

    let mut current = state.phase;
    while let Some(next) = current.next() {
        current = next;
        if plan.cycles_for(next) == 0 {
            if state.completed.insert(next) {
                actions.push(Action::PhaseCompleted { phase: next });
            }
            continue;
        }

        state.phase = next;
        state.cycle = Cycle::new(next, 0, plan.parameters_for(next, 0));
        actions.push(state.request_fragment(None));
        return state;
    }

    state.phase = current;
    state.status = Status::Complete;
    actions.push(Action::PipelineComplete);
    state
}
