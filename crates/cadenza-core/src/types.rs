//! Core type definitions for the dispatch pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{CadenzaError, Result};

/// Failure message recorded when no feedback arrives in time
pub const TIMEOUT_REASON: &str = "timeout";

/// Parameters used to generate the fragment(s) of one cycle
pub type CycleParams = BTreeMap<String, String>;

/// Pipeline stage, in fixed execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    Generation,
    Arrangement,
    Mixing,
    Finalization,
}

impl Phase {
    /// All phases in pipeline order
    pub const ALL: [Phase; 5] = [
        Phase::Initialization,
        Phase::Generation,
        Phase::Arrangement,
        Phase::Mixing,
        Phase::Finalization,
    ];

    /// The phase every pipeline starts in
    pub fn first() -> Self {
        Phase::Initialization
    }

    /// Next phase in order, or `None` after Finalization
    pub fn next(self) -> Option<Self> {
        let idx = self.index();
        Self::ALL.get(idx + 1).copied()
    }

    /// Zero-based position in the pipeline
    pub fn index(self) -> usize {
        match self {
            Self::Initialization => 0,
            Self::Generation => 1,
            Self::Arrangement => 2,
            Self::Mixing => 3,
            Self::Finalization => 4,
        }
    }

    pub fn is_last(self) -> bool {
        self.next().is_none()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialization => write!(f, "initialization"),
            Self::Generation => write!(f, "generation"),
            Self::Arrangement => write!(f, "arrangement"),
            Self::Mixing => write!(f, "mixing"),
            Self::Finalization => write!(f, "finalization"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initialization" | "init" => Ok(Self::Initialization),
            "generation" | "generate" => Ok(Self::Generation),
            "arrangement" | "arrange" => Ok(Self::Arrangement),
            "mixing" | "mix" => Ok(Self::Mixing),
            "finalization" | "final" => Ok(Self::Finalization),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Identifier assigned to each dispatch attempt
///
/// Allocated from a monotonically increasing counter, so ordering by id is
/// ordering by dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DispatchId(pub u64);

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "d-{:04}", self.0)
    }
}

/// Identifier for one pipeline run (used in log fields and exports)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", &self.0.to_string()[..8])
    }
}

/// Result of executing one fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed(String),
}

impl Outcome {
    /// A failure caused by missing feedback
    pub fn timeout() -> Self {
        Outcome::Failed(TIMEOUT_REASON.to_string())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// Failure text, if this outcome is a failure
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Outcome::Failed(msg) => Some(msg),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// A block of Sonic Pi source, frozen at dispatch time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: DispatchId,
    pub phase: Phase,
    pub cycle: u32,
    pub content: String,
    pub dispatched_at: DateTime<Utc>,
}

/// What the caller hands to the dispatcher before an id is assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSpec {
    pub phase: Phase,
    pub cycle: u32,
    pub content: String,
}

impl FragmentSpec {
    pub fn new(phase: Phase, cycle: u32, content: impl Into<String>) -> Self {
        Self {
            phase,
            cycle,
            content: content.into(),
        }
    }
}

/// One entry of the code version log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub fragment: Fragment,
    pub outcome: Outcome,
    /// Attempt index within the cycle: 0 for the first send, 1 for the first retry
    pub retry_count: u32,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DispatchRecord {
    pub fn new(fragment: Fragment, retry_count: u32) -> Self {
        Self {
            fragment,
            outcome: Outcome::Pending,
            retry_count,
            resolved_at: None,
        }
    }

    pub fn id(&self) -> DispatchId {
        self.fragment.id
    }

    /// Move a pending record to a terminal outcome
    ///
    /// Outcomes change exactly once. Resolving an already terminal record, or
    /// resolving to `Pending`, is rejected and leaves the record untouched.
    pub fn resolve(&mut self, outcome: Outcome) -> Result<()> {
        if self.outcome.is_terminal() {
            return Err(CadenzaError::OutcomeResolved(self.id().to_string()));
        }
        if outcome.is_pending() {
            return Err(CadenzaError::Dispatch(format!(
                "Cannot resolve {} to pending",
                self.id()
            )));
        }
        self.outcome = outcome;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

/// Exported view of a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub phase: Phase,
    pub cycle: u32,
    pub code_text: String,
    pub outcome: Outcome,
}

impl From<&DispatchRecord> for ExportEntry {
    fn from(record: &DispatchRecord) -> Self {
        Self {
            phase: record.fragment.phase,
            cycle: record.fragment.cycle,
            code_text: record.fragment.content.clone(),
            outcome: record.outcome.clone(),
        }
    }
}

/// A bounded unit of work within a phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub phase: Phase,
    pub index: u32,
    pub parameters: CycleParams,
    /// Dispatch attempts produced within this cycle, in order
    pub dispatches: Vec<DispatchId>,
    pub complete: bool,
}

impl Cycle {
    pub fn new(phase: Phase, index: u32, parameters: CycleParams) -> Self {
        Self {
            phase,
            index,
            parameters,
            dispatches: Vec::new(),
            complete: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DispatchRecord {
        DispatchRecord::new(
            Fragment {
                id: DispatchId(1),
                phase: Phase::Generation,
                cycle: 0,
                content: "play :e2".to_string(),
                dispatched_at: Utc::now(),
            },
            0,
        )
    }

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::first(), Phase::Initialization);
        assert_eq!(Phase::Initialization.next(), Some(Phase::Generation));
        assert_eq!(Phase::Mixing.next(), Some(Phase::Finalization));
        assert_eq!(Phase::Finalization.next(), None);
        assert!(Phase::Finalization.is_last());
        assert!(Phase::Generation < Phase::Arrangement);
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("Generation".parse::<Phase>().unwrap(), Phase::Generation);
        assert_eq!("mix".parse::<Phase>().unwrap(), Phase::Mixing);
        assert!("mastering".parse::<Phase>().is_err());
    }

    #[test]
    fn test_dispatch_id_display() {
        assert_eq!(DispatchId(7).to_string(), "d-0007");
    }

    #[test]
    fn test_outcome_resolves_once() {
        let mut rec = record();
        assert!(rec.outcome.is_pending());

        rec.resolve(Outcome::Succeeded).unwrap();
        assert_eq!(rec.outcome, Outcome::Succeeded);
        assert!(rec.resolved_at.is_some());

        let err = rec.resolve(Outcome::Failed("late".to_string()));
        assert!(matches!(err, Err(CadenzaError::OutcomeResolved(_))));
        assert_eq!(rec.outcome, Outcome::Succeeded);
    }

    #[test]
    fn test_cannot_resolve_to_pending() {
        let mut rec = record();
        assert!(rec.resolve(Outcome::Pending).is_err());
        assert!(rec.outcome.is_pending());
    }

    #[test]
    fn test_timeout_outcome() {
        let outcome = Outcome::timeout();
        assert_eq!(outcome.failure_message(), Some(TIMEOUT_REASON));
        assert!(outcome.is_terminal());
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&Outcome::Failed("boom".to_string())).unwrap();
        assert_eq!(json, r#"{"status":"failed","message":"boom"}"#);

        let json = serde_json::to_string(&Outcome::Succeeded).unwrap();
        assert_eq!(json, r#"{"status":"succeeded"}"#);
    }

    #[test]
    fn test_export_entry_from_record() {
        let rec = record();
        let entry = ExportEntry::from(&rec);
        assert_eq!(entry.phase, Phase::Generation);
        assert_eq!(entry.code_text, "play :e2");
        assert_eq!(entry.outcome, Outcome::Pending);
    }
}
