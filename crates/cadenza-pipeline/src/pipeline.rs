//! Pipeline driver
//!
//! Owns the [`PipelineState`] and is the only place it changes: every event
//! goes through [`transition`], and the resulting actions are carried out
//! here (generate, normalize, dispatch with retries). Observers read
//! [`PipelineSnapshot`]s, by polling or through a watch channel.
//!
//! Cancellation is checked between cycles, so a cancelled run never leaves a
//! dispatch record Pending.

use cadenza_bridge::{
    CodeTransport, CommandDispatcher, DispatchResolution, FeedbackListener, FeedbackSource,
    ListenerHandle, ListenerStats,
};
use cadenza_core::{CadenzaError, CycleParams, ExportEntry, FragmentSpec, Phase, Result, RunId};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::generator::{FragmentGenerator, GenerationRequest};
use crate::normalize::normalize_fragment;
use crate::phases::PhasePlan;
use crate::state_machine::{transition, Action, Event, PipelineState, Status};

/// Read-only view of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub run_id: RunId,
    pub phase: Phase,
    pub completed: Vec<Phase>,
    pub cycle: u32,
    pub status: Status,
    pub blocked: bool,
    /// Code version log, in dispatch order
    pub entries: Vec<ExportEntry>,
}

/// Operator decision for a blocked run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the cycle with its current parameters
    Same,
    WithParameters(CycleParams),
    /// Give up; the run is cancelled
    Abort,
}

/// Requests cancellation of a run from another task
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Pipeline<T: CodeTransport + 'static, G: FragmentGenerator> {
    run_id: RunId,
    plan: PhasePlan,
    dispatcher: Arc<CommandDispatcher<T>>,
    generator: G,
    normalize: bool,
    state: PipelineState,
    requests: VecDeque<GenerationRequest>,
    snapshots: watch::Sender<PipelineSnapshot>,
    cancel: CancelHandle,
    listener: Option<ListenerHandle>,
}

impl<T: CodeTransport + 'static, G: FragmentGenerator> Pipeline<T, G> {
    pub fn new(dispatcher: Arc<CommandDispatcher<T>>, generator: G, plan: PhasePlan) -> Self {
        let run_id = RunId::new();
        let (state, actions) = PipelineState::start(&plan);
        let (snapshots, _) = watch::channel(build_snapshot(run_id, &state, Vec::new()));

        let mut pipeline = Self {
            run_id,
            plan,
            dispatcher,
            generator,
            normalize: true,
            state,
            requests: VecDeque::new(),
            snapshots,
            cancel: CancelHandle::default(),
            listener: None,
        };
        pipeline.absorb(actions);
        pipeline
    }

    /// Toggle fragment normalization (on by default)
    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// Start the feedback listener feeding this pipeline's dispatcher
    ///
    /// Call before the first `step`/`run`; the listener lives until `close`.
    pub fn spawn_listener<S: FeedbackSource>(&mut self, source: S) {
        let handle = FeedbackListener::spawn(source, self.dispatcher.clone());
        info!(listener = %handle.description(), "Feedback listener attached");
        if let Some(previous) = self.listener.replace(handle) {
            // Replaced listener is stopped in the background
            tokio::spawn(previous.shutdown());
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher<T>> {
        &self.dispatcher
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Receive a snapshot after every transition
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshots.subscribe()
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        build_snapshot(self.run_id, &self.state, self.dispatcher.export().await)
    }

    /// Execute one cycle (or honour a pending cancellation)
    ///
    /// Fails without dispatching if no feedback listener is running.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn step(&mut self) -> Result<Status> {
        if self.cancel.is_cancelled() && !self.state.is_terminal() {
            self.apply(Event::Cancel).await;
            return Ok(self.state.status.clone());
        }
        if self.state.status != Status::Running {
            return Ok(self.state.status.clone());
        }

        if !self.listener.as_ref().is_some_and(ListenerHandle::is_running) {
            return Err(CadenzaError::Pipeline(
                "no feedback listener attached; call spawn_listener before dispatching".to_string(),
            ));
        }

        let request = self.requests.pop_front().ok_or_else(|| {
            CadenzaError::Pipeline(format!(
                "{} cycle {} is running but nothing was requested",
                self.state.phase, self.state.cycle.index
            ))
        })?;

        let event = self.execute(&request).await?;
        self.apply(event).await;
        Ok(self.state.status.clone())
    }

    /// Step until the run completes, blocks or is cancelled
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn run(&mut self) -> Result<PipelineSnapshot> {
        info!(
            cycles = self.plan.total_cycles(),
            phase = %self.state.phase,
            "Pipeline running"
        );

        while self.step().await? == Status::Running {}

        let snapshot = self.snapshot().await;
        match &snapshot.status {
            Status::Blocked { reason } => warn!(
                phase = %snapshot.phase,
                cycle = snapshot.cycle,
                "Pipeline blocked: {}",
                reason
            ),
            status => info!(dispatches = snapshot.entries.len(), "Pipeline {}", status),
        }
        Ok(snapshot)
    }

    /// Resume a blocked run
    pub async fn retry(&mut self, decision: RetryDecision) -> Result<()> {
        if !self.state.is_blocked() {
            return Err(CadenzaError::Pipeline(format!(
                "cannot retry: pipeline is {}",
                self.state.status
            )));
        }

        let event = match decision {
            RetryDecision::Same => Event::RetryRequested { parameters: None },
            RetryDecision::WithParameters(parameters) => Event::RetryRequested {
                parameters: Some(parameters),
            },
            RetryDecision::Abort => Event::Cancel,
        };
        self.apply(event).await;
        Ok(())
    }

    /// Write the code version log as JSON
    pub async fn write_export(&self, path: &Path) -> Result<()> {
        self.dispatcher.log().await.write_export(path)?;
        info!(path = %path.display(), "Code version log exported");
        Ok(())
    }

    /// Stop the listener (if any) and return the final snapshot
    pub async fn close(mut self) -> (PipelineSnapshot, Option<ListenerStats>) {
        let stats = match self.listener.take() {
            Some(listener) => Some(listener.shutdown().await),
            None => None,
        };
        (self.snapshot().await, stats)
    }

    /// Generate and dispatch one cycle's fragment
    async fn execute(&self, request: &GenerationRequest) -> Result<Event> {
        let content = match self.generator.generate(request).await {
            Ok(content) => content,
            Err(e) => {
                let detail = match e {
                    CadenzaError::Generation(message) => message,
                    other => other.to_string(),
                };
                warn!(phase = %request.phase, cycle = request.cycle, "Generator failed: {}", detail);
                return Ok(Event::CycleExhausted {
                    reason: format!("generation failed: {}", detail),
                    ids: Vec::new(),
                });
            }
        };

        let content = if self.normalize {
            normalize_fragment(&content)
        } else {
            content
        };
        let spec = FragmentSpec::new(request.phase, request.cycle, content);

        Ok(match self.dispatcher.dispatch_with_retry(&spec).await? {
            DispatchResolution::Succeeded { ids, .. } => Event::CycleSucceeded { ids },
            DispatchResolution::Exhausted { last_error, ids } => Event::CycleExhausted {
                reason: last_error,
                ids,
            },
        })
    }

    async fn apply(&mut self, event: Event) {
        let (state, actions) = transition(self.state.clone(), event, &self.plan);
        self.state = state;
        self.absorb(actions);

        let snapshot = self.snapshot().await;
        self.snapshots.send_replace(snapshot);
    }

    fn absorb(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::RequestFragment {
                    phase,
                    cycle,
                    parameters,
                    previous_failure,
                } => {
                    debug!(phase = %phase, cycle, "Fragment requested");
                    self.requests.push_back(GenerationRequest {
                        phase,
                        cycle,
                        parameters,
                        previous_failure,
                    });
                }
                Action::PhaseCompleted { phase } => info!(phase = %phase, "Phase completed"),
                Action::SurfaceFailure {
                    phase,
                    cycle,
                    reason,
                } => error!(phase = %phase, cycle, "Cycle failed, pipeline blocked: {}", reason),
                Action::PipelineComplete => info!("All phases completed"),
                Action::PipelineCancelled => {
                    // Nothing left to dispatch
                    self.requests.clear();
                    info!("Pipeline cancelled");
                }
                Action::Rejected { reason } => warn!("Event rejected: {}", reason),
            }
        }
    }
}

fn build_snapshot(
    run_id: RunId,
    state: &PipelineState,
    entries: Vec<ExportEntry>,
) -> PipelineSnapshot {
    PipelineSnapshot {
        run_id,
        phase: state.phase,
        completed: state.completed.iter().copied().collect(),
        cycle: state.cycle.index,
        status: state.status.clone(),
        blocked: state.is_blocked(),
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::StaticGenerator;
    use cadenza_bridge::{
        ChannelFeedbackSource, DispatcherSettings, EngineProfile, Reply, ScriptedSandbox,
        SimulatedEngine,
    };
    use cadenza_core::config::DispatchConfig;

    type SimPipeline = Pipeline<SimulatedEngine<ScriptedSandbox>, StaticGenerator>;

    fn pipeline(
        sandbox: ScriptedSandbox,
        plan: PhasePlan,
        generator: StaticGenerator,
    ) -> SimPipeline {
        let (tx, source) = ChannelFeedbackSource::channel();
        let profile = EngineProfile {
            success_token: "OK".to_string(),
            ..EngineProfile::default()
        };
        let settings = DispatcherSettings {
            run_code_path: profile.run_code_path.clone(),
            success_token: "OK".to_string(),
            policy: DispatchConfig {
                timeout_floor_ms: 100,
                timeout_grace_ms: 0,
                retry_budget: 1,
                wait_notice_ms: 0,
            },
        };
        let engine = SimulatedEngine::new(sandbox, profile, tx);
        let dispatcher = Arc::new(CommandDispatcher::new(engine, settings));
        let mut pipeline = Pipeline::new(dispatcher, generator, plan);
        pipeline.spawn_listener(source);
        pipeline
    }

    #[tokio::test]
    async fn test_step_advances_one_cycle() {
        let mut p = pipeline(
            ScriptedSandbox::always(Reply::Success),
            PhasePlan::uniform(1),
            StaticGenerator::uniform("play 60"),
        );
        assert_eq!(p.step().await.unwrap(), Status::Running);
        assert_eq!(p.state().phase, Phase::Generation);
        assert!(p.state().completed.contains(&Phase::Initialization));

        let (snapshot, stats) = p.close().await;
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(stats.map(|s| s.delivered), Some(1));
    }

    fn unlistened(plan: PhasePlan) -> SimPipeline {
        let (tx, _source) = ChannelFeedbackSource::channel();
        let engine = SimulatedEngine::new(
            ScriptedSandbox::always(Reply::Success),
            EngineProfile::default(),
            tx,
        );
        let dispatcher = Arc::new(CommandDispatcher::new(engine, DispatcherSettings::default()));
        Pipeline::new(dispatcher, StaticGenerator::uniform("play 60"), plan)
    }

    #[tokio::test]
    async fn test_step_without_listener_refuses_to_dispatch() {
        let mut p = unlistened(PhasePlan::uniform(1));

        assert!(matches!(p.step().await, Err(CadenzaError::Pipeline(_))));
        assert!(matches!(p.run().await, Err(CadenzaError::Pipeline(_))));
        assert!(p.dispatcher().records().await.is_empty());
        assert_eq!(p.state().status, Status::Running);
    }

    #[tokio::test]
    async fn test_step_after_listener_stopped_refuses_to_dispatch() {
        let mut p = unlistened(PhasePlan::uniform(1));
        let (closed_tx, closed_source) = ChannelFeedbackSource::channel();
        drop(closed_tx);
        p.spawn_listener(closed_source);

        // The listener exits once it sees its source closed
        for _ in 0..50 {
            if !p.listener.as_ref().is_some_and(ListenerHandle::is_running) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(matches!(p.step().await, Err(CadenzaError::Pipeline(_))));
        assert!(p.dispatcher().records().await.is_empty());
    }

    #[tokio::test]
    async fn test_generator_error_blocks_cycle() {
        let mut p = pipeline(
            ScriptedSandbox::always(Reply::Success),
            PhasePlan::uniform(1),
            StaticGenerator::new().with_phase(Phase::Initialization, "use_bpm 120"),
        );
        let snapshot = p.run().await.unwrap();

        assert!(snapshot.blocked);
        assert_eq!(snapshot.phase, Phase::Generation);
        match snapshot.status {
            Status::Blocked { reason } => assert!(reason.starts_with("generation failed: ")),
            other => panic!("expected blocked, got {}", other),
        }
        // Nothing was dispatched for the failed cycle
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_normalization_applied_before_dispatch() {
        let mut p = pipeline(
            ScriptedSandbox::always(Reply::Success),
            PhasePlan::uniform(0).with_cycles(Phase::Generation, 1),
            StaticGenerator::uniform("play :C#4"),
        );
        let snapshot = p.run().await.unwrap();
        assert_eq!(snapshot.status, Status::Complete);
        assert_eq!(snapshot.entries[0].code_text, "play :cs4");
        assert_eq!(
            p.dispatcher().transport().sandbox().evaluated(),
            vec!["play :cs4"]
        );
    }

    #[tokio::test]
    async fn test_retry_when_not_blocked_is_an_error() {
        let mut p = pipeline(
            ScriptedSandbox::always(Reply::Success),
            PhasePlan::uniform(1),
            StaticGenerator::uniform("play 60"),
        );
        assert!(matches!(
            p.retry(RetryDecision::Same).await,
            Err(CadenzaError::Pipeline(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshots_are_published() {
        let mut p = pipeline(
            ScriptedSandbox::always(Reply::Success),
            PhasePlan::uniform(1),
            StaticGenerator::uniform("play 60"),
        );
        let mut rx = p.subscribe();
        assert_eq!(rx.borrow().phase, Phase::Initialization);

        p.step().await.unwrap();
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.phase, Phase::Generation);
        assert_eq!(seen.completed, vec![Phase::Initialization]);
        assert_eq!(seen.entries.len(), 1);
    }
}
