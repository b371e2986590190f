//! Command dispatcher with FIFO feedback correlation
//!
//! The engine's feedback carries no request id, only free text. Correlation
//! is therefore by order: at most one dispatch is outstanding at any time and
//! the next feedback message belongs to it. The dispatch slot is a one-permit
//! semaphore; the permit lives inside the outstanding entry and is released
//! when that entry resolves (feedback, timeout, or local send failure).
//!
//! The dispatch table (log + outstanding slot) is the only shared mutable
//! state and is touched only under its mutex.

use async_trait::async_trait;
use cadenza_core::config::DispatchConfig;
use cadenza_core::{
    CadenzaConfig, CadenzaError, DispatchId, DispatchRecord, ExportEntry, Fragment, FragmentSpec,
    Outcome, Result,
};
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::code_log::CodeVersionLog;
use crate::osc::OscMessage;
use crate::transport::CodeTransport;

static SLEEP_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Sum of the fragment's top-level `sleep N` calls, in seconds
///
/// Sonic Pi reports back once `eval` returns, so a fragment that sleeps
/// for 30 beats needs a window of at least that long (at 60 bpm).
pub fn estimate_runtime(content: &str) -> Duration {
    let pattern = SLEEP_PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*sleep[\s(]+([0-9]*\.?[0-9]+)").expect("sleep pattern is valid")
    });

    let seconds: f64 = pattern
        .captures_iter(content)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
        .sum();

    // Absurd sleeps saturate instead of overflowing the conversion
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

/// Settings the dispatcher needs from the project config
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub run_code_path: String,
    pub success_token: String,
    pub policy: DispatchConfig,
}

impl DispatcherSettings {
    pub fn from_config(config: &CadenzaConfig) -> Self {
        Self {
            run_code_path: config.engine.run_code_path.clone(),
            success_token: config.feedback.success_token.clone(),
            policy: config.dispatch.clone(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&CadenzaConfig::default())
    }
}

/// What happened to an incoming feedback payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackDisposition {
    /// Matched to the outstanding dispatch
    Correlated { id: DispatchId, outcome: Outcome },
    /// Nothing was outstanding; discarded
    Orphan,
}

/// Final result of a dispatch including retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResolution {
    Succeeded {
        id: DispatchId,
        attempts: u32,
        ids: Vec<DispatchId>,
    },
    /// Every attempt failed; terminal for the cycle
    Exhausted {
        last_error: String,
        ids: Vec<DispatchId>,
    },
}

impl DispatchResolution {
    /// Every dispatch attempt made, in order
    pub fn ids(&self) -> &[DispatchId] {
        match self {
            Self::Succeeded { ids, .. } | Self::Exhausted { ids, .. } => ids,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Handle for one dispatch attempt
#[derive(Debug)]
pub struct PendingDispatch {
    id: DispatchId,
    timeout: Duration,
    outcome: oneshot::Receiver<Outcome>,
}

impl PendingDispatch {
    pub fn id(&self) -> DispatchId {
        self.id
    }

    /// Feedback window armed for this attempt
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the attempt to resolve (feedback or forced timeout)
    pub async fn outcome(self) -> Outcome {
        self.outcome.await.unwrap_or_else(|_| abandoned())
    }
}

fn abandoned() -> Outcome {
    Outcome::Failed("dispatch abandoned".to_string())
}

/// Receiver of raw feedback payloads (implemented by the dispatcher)
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn deliver(&self, payload: String);
}

struct Outstanding {
    id: DispatchId,
    notify: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct DispatchTable {
    log: CodeVersionLog,
    outstanding: Option<Outstanding>,
    next_id: u64,
}

impl DispatchTable {
    fn allocate_id(&mut self) -> DispatchId {
        self.next_id += 1;
        DispatchId(self.next_id)
    }

    /// Resolve whatever is outstanding; releases the dispatch slot
    fn resolve_outstanding(&mut self, outcome: Outcome) -> Option<(DispatchId, Outcome)> {
        let outstanding = self.outstanding.take()?;
        let id = outstanding.id;

        if let Err(e) = self.log.resolve(id, outcome.clone()) {
            error!(dispatch_id = %id, "Outstanding record could not be resolved: {}", e);
        }
        if let Some(timer) = outstanding.timer {
            timer.abort();
        }
        // The waiter may have been dropped; the log already has the outcome
        let _ = outstanding.notify.send(outcome.clone());

        Some((id, outcome))
    }

    /// Resolve `id` only if it is still the outstanding dispatch
    fn resolve_if_outstanding(&mut self, id: DispatchId, outcome: Outcome) -> bool {
        match self.outstanding.as_mut() {
            Some(entry) if entry.id == id => {
                // Never abort the task that is calling us
                entry.timer = None;
                self.resolve_outstanding(outcome).is_some()
            }
            _ => false,
        }
    }
}

/// Sends fragments to the engine and correlates feedback to them
pub struct CommandDispatcher<T: CodeTransport> {
    transport: T,
    settings: DispatcherSettings,
    table: Arc<Mutex<DispatchTable>>,
    slot: Arc<Semaphore>,
}

impl<T: CodeTransport> CommandDispatcher<T> {
    pub fn new(transport: T, settings: DispatcherSettings) -> Self {
        Self {
            transport,
            settings,
            table: Arc::new(Mutex::new(DispatchTable::default())),
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send one attempt of a fragment
    ///
    /// Waits for the dispatch slot if another attempt is outstanding, then
    /// records a Pending entry, arms the timeout, sends and returns without
    /// waiting for feedback. A local send failure resolves the attempt to
    /// Failed immediately; it still appears in the log.
    #[instrument(skip_all, fields(phase = %spec.phase, cycle = spec.cycle, attempt = retry_count))]
    pub async fn dispatch(&self, spec: &FragmentSpec, retry_count: u32) -> Result<PendingDispatch> {
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CadenzaError::Dispatch("Dispatch slot closed".to_string()))?;

        let timeout = self
            .settings
            .policy
            .timeout_for(estimate_runtime(&spec.content));
        let (notify, outcome) = oneshot::channel();

        // Register and arm the timer before sending: a fast reply always
        // finds its record, and a caller dropped mid-send still frees the slot
        let id = {
            let mut table = self.table.lock().await;
            let id = table.allocate_id();
            let fragment = Fragment {
                id,
                phase: spec.phase,
                cycle: spec.cycle,
                content: spec.content.clone(),
                dispatched_at: Utc::now(),
            };
            table.log.append(DispatchRecord::new(fragment, retry_count))?;
            let timer = self.arm_timer(id, timeout);
            table.outstanding = Some(Outstanding {
                id,
                notify,
                timer: Some(timer),
                _permit: permit,
            });
            id
        };

        let message = OscMessage::run_code(&self.settings.run_code_path, &spec.content);
        if let Err(e) = self.transport.send(&message).await {
            warn!(dispatch_id = %id, "Send to {} failed: {}", self.transport.target(), e);
            let mut table = self.table.lock().await;
            if table.outstanding.as_ref().map(|entry| entry.id) == Some(id) {
                table.resolve_outstanding(Outcome::Failed(format!("send failed: {}", e)));
            }
            return Ok(PendingDispatch { id, timeout, outcome });
        }

        info!(
            dispatch_id = %id,
            engine = %self.transport.target(),
            timeout_ms = timeout.as_millis() as u64,
            "Fragment dispatched"
        );
        Ok(PendingDispatch { id, timeout, outcome })
    }

    /// Spawn the task that forces `id` to timeout once the window closes
    fn arm_timer(&self, id: DispatchId, timeout: Duration) -> AbortHandle {
        let table = Arc::clone(&self.table);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if table
                .lock()
                .await
                .resolve_if_outstanding(id, Outcome::timeout())
            {
                warn!(dispatch_id = %id, timeout_ms = timeout.as_millis() as u64, "No feedback within window; forced timeout");
            }
        });
        timer.abort_handle()
    }

    /// Correlate a feedback payload with the outstanding dispatch
    ///
    /// Orphans (no outstanding dispatch, e.g. a reply arriving after its
    /// forced timeout) are logged and dropped.
    pub async fn on_feedback(&self, payload: &str) -> FeedbackDisposition {
        let outcome = self.classify(payload);
        let resolved = self.table.lock().await.resolve_outstanding(outcome);

        match resolved {
            Some((id, outcome)) => {
                match &outcome {
                    Outcome::Succeeded => info!(dispatch_id = %id, "Engine reported success"),
                    other => warn!(dispatch_id = %id, "Engine reported {}", other),
                }
                FeedbackDisposition::Correlated { id, outcome }
            }
            None => {
                warn!(payload = %payload, "Orphan feedback discarded: nothing outstanding");
                FeedbackDisposition::Orphan
            }
        }
    }

    /// Success token means success; any other text is the failure message
    pub fn classify(&self, payload: &str) -> Outcome {
        if payload.trim() == self.settings.success_token {
            Outcome::Succeeded
        } else {
            Outcome::Failed(payload.to_string())
        }
    }

    /// Dispatch a fragment, redispatching the same content on failure
    ///
    /// Timeouts, engine-reported failures and local send failures all count
    /// against the retry budget. With budget N there are at most N + 1
    /// attempts, each a separate log entry.
    pub async fn dispatch_with_retry(&self, spec: &FragmentSpec) -> Result<DispatchResolution> {
        let budget = self.settings.policy.retry_budget;
        let mut ids = Vec::new();
        let mut attempt = 0;

        loop {
            let pending = self.dispatch(spec, attempt).await?;
            let id = pending.id();
            ids.push(id);

            match self.await_outcome(pending).await {
                Outcome::Succeeded => {
                    return Ok(DispatchResolution::Succeeded {
                        id,
                        attempts: attempt + 1,
                        ids,
                    });
                }
                failed => {
                    let reason = failed
                        .failure_message()
                        .map(str::to_string)
                        .unwrap_or_else(|| failed.to_string());

                    if attempt >= budget {
                        error!(
                            phase = %spec.phase,
                            cycle = spec.cycle,
                            attempts = attempt + 1,
                            "Retry budget exhausted: {}",
                            reason
                        );
                        return Ok(DispatchResolution::Exhausted {
                            last_error: reason,
                            ids,
                        });
                    }

                    attempt += 1;
                    warn!(
                        dispatch_id = %id,
                        retry = attempt,
                        budget,
                        "Attempt failed ({}); redispatching",
                        reason
                    );
                }
            }
        }
    }

    /// Wait for an attempt, logging a hint while the engine stays silent
    async fn await_outcome(&self, pending: PendingDispatch) -> Outcome {
        let id = pending.id;
        let mut outcome = pending.outcome;
        let notice = self.settings.policy.wait_notice();

        if notice.is_zero() {
            return outcome.await.unwrap_or_else(|_| abandoned());
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + notice, notice);
        loop {
            tokio::select! {
                result = &mut outcome => return result.unwrap_or_else(|_| abandoned()),
                _ = ticker.tick() => {
                    info!(
                        dispatch_id = %id,
                        "Still waiting for feedback. If nothing is playing, run the listen loop in Sonic Pi (cadenza setup)"
                    );
                }
            }
        }
    }

    /// Force the outstanding attempt (if any) to `Failed("timeout")`
    pub async fn force_timeout(&self) -> Option<DispatchId> {
        let resolved = self
            .table
            .lock()
            .await
            .resolve_outstanding(Outcome::timeout());
        if let Some((id, _)) = &resolved {
            debug!(dispatch_id = %id, "Outstanding dispatch forced to timeout");
        }
        resolved.map(|(id, _)| id)
    }

    /// Whether an attempt is waiting for feedback
    pub async fn has_outstanding(&self) -> bool {
        self.table.lock().await.outstanding.is_some()
    }

    /// Copy of the code version log
    pub async fn log(&self) -> CodeVersionLog {
        self.table.lock().await.log.clone()
    }

    /// Copy of all records in dispatch order
    pub async fn records(&self) -> Vec<DispatchRecord> {
        self.table.lock().await.log.records().to_vec()
    }

    pub async fn export(&self) -> Vec<ExportEntry> {
        self.table.lock().await.log.export()
    }
}

#[async_trait]
impl<T: CodeTransport> FeedbackSink for CommandDispatcher<T> {
    async fn deliver(&self, payload: String) {
        self.on_feedback(&payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use cadenza_core::{Phase, TIMEOUT_REASON};

    fn settings(timeout_ms: u64, retry_budget: u32) -> DispatcherSettings {
        DispatcherSettings {
            run_code_path: "/run-code".to_string(),
            success_token: "OK".to_string(),
            policy: DispatchConfig {
                timeout_floor_ms: timeout_ms,
                timeout_grace_ms: 0,
                retry_budget,
                wait_notice_ms: 0,
            },
        }
    }

    fn dispatcher(timeout_ms: u64, retry_budget: u32) -> Arc<CommandDispatcher<MockTransport>> {
        Arc::new(CommandDispatcher::new(
            MockTransport::new(),
            settings(timeout_ms, retry_budget),
        ))
    }

    #[test]
    fn test_estimate_runtime_sums_sleeps() {
        let code = "play :e2\nsleep 1\nplay :g2\n  sleep 0.5\nsleep(2)\n# sleep 100\n";
        assert_eq!(estimate_runtime(code), Duration::from_millis(3_500));
        assert_eq!(estimate_runtime("play 60"), Duration::ZERO);
    }

    #[test]
    fn test_estimate_runtime_saturates_huge_sleeps() {
        assert_eq!(estimate_runtime("sleep 99999999999999999999"), Duration::MAX);
        let code = format!("sleep 1\n{}", "sleep 99999999999999999999\n".repeat(3));
        assert_eq!(estimate_runtime(&code), Duration::MAX);
    }

    #[tokio::test]
    async fn test_huge_sleep_dispatches_normally() {
        let d = Arc::new(CommandDispatcher::new(
            MockTransport::new(),
            DispatcherSettings::default(),
        ));
        let spec = FragmentSpec::new(
            Phase::Generation,
            0,
            "sleep 99999999999999999999\nplay 60",
        );

        let pending = d.dispatch(&spec, 0).await.unwrap();
        assert_eq!(pending.timeout(), Duration::MAX);
        assert_eq!(d.records().await[0].outcome, Outcome::Pending);

        d.on_feedback(&d.settings().success_token.clone()).await;
        assert_eq!(pending.outcome().await, Outcome::Succeeded);
    }

    /// Transport whose send never completes
    struct StalledTransport;

    #[async_trait]
    impl CodeTransport for StalledTransport {
        async fn send(&self, _message: &OscMessage) -> Result<()> {
            std::future::pending().await
        }

        fn target(&self) -> String {
            "stalled://engine".to_string()
        }
    }

    #[tokio::test]
    async fn test_dropped_dispatch_still_times_out_and_frees_slot() {
        let d = CommandDispatcher::new(StalledTransport, settings(50, 0));
        let spec = FragmentSpec::new(Phase::Generation, 0, "play 60");

        let dropped = tokio::time::timeout(Duration::from_millis(10), d.dispatch(&spec, 0)).await;
        assert!(dropped.is_err());
        assert!(d.has_outstanding().await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!d.has_outstanding().await);
        assert_eq!(d.records().await[0].outcome, Outcome::timeout());

        // The slot is free again: the next attempt registers immediately
        let next = tokio::time::timeout(Duration::from_millis(10), d.dispatch(&spec, 1)).await;
        assert!(next.is_err());
        assert_eq!(d.records().await.len(), 2);
    }

    #[tokio::test]
    async fn test_success_scenario() {
        let d = dispatcher(5_000, 2);
        let spec = FragmentSpec::new(Phase::Generation, 0, "play :e2");

        let pending = d.dispatch(&spec, 0).await.unwrap();
        assert!(d.has_outstanding().await);

        let disposition = d.on_feedback("OK").await;
        assert_eq!(
            disposition,
            FeedbackDisposition::Correlated {
                id: pending.id(),
                outcome: Outcome::Succeeded
            }
        );
        assert_eq!(pending.outcome().await, Outcome::Succeeded);
        assert!(!d.has_outstanding().await);

        let sent = d.transport().sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].path, "/run-code");
        assert_eq!(sent[0].first_str(), Some("play :e2"));
    }

    #[tokio::test]
    async fn test_failure_text_becomes_message() {
        let d = dispatcher(5_000, 2);
        let pending = d
            .dispatch(&FragmentSpec::new(Phase::Generation, 0, "play :zz2"), 0)
            .await
            .unwrap();

        d.on_feedback("NameError: zz2 undefined").await;
        assert_eq!(
            pending.outcome().await,
            Outcome::Failed("NameError: zz2 undefined".to_string())
        );
    }

    #[tokio::test]
    async fn test_fifo_correlation_ignores_content() {
        let d = dispatcher(5_000, 0);

        let first = d
            .dispatch(&FragmentSpec::new(Phase::Generation, 0, "D1"), 0)
            .await
            .unwrap();
        d.on_feedback("F1").await;
        assert_eq!(first.outcome().await, Outcome::Failed("F1".to_string()));

        let second = d
            .dispatch(&FragmentSpec::new(Phase::Generation, 1, "D2"), 0)
            .await
            .unwrap();
        d.on_feedback("F2").await;
        assert_eq!(second.outcome().await, Outcome::Failed("F2".to_string()));

        let records = d.records().await;
        assert_eq!(records[0].fragment.content, "D1");
        assert_eq!(records[0].outcome, Outcome::Failed("F1".to_string()));
        assert_eq!(records[1].fragment.content, "D2");
        assert_eq!(records[1].outcome, Outcome::Failed("F2".to_string()));
    }

    #[tokio::test]
    async fn test_second_dispatch_waits_for_first() {
        let d = dispatcher(5_000, 0);
        let first = d
            .dispatch(&FragmentSpec::new(Phase::Generation, 0, "one"), 0)
            .await
            .unwrap();

        let d2 = Arc::clone(&d);
        let second = tokio::spawn(async move {
            d2.dispatch(&FragmentSpec::new(Phase::Generation, 1, "two"), 0)
                .await
                .unwrap()
                .id()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());
        assert_eq!(d.records().await.len(), 1);
        assert_eq!(d.log().await.pending().count(), 1);

        d.on_feedback("OK").await;
        assert_eq!(first.outcome().await, Outcome::Succeeded);

        let second_id = second.await.unwrap();
        assert!(second_id > DispatchId(1));
        assert_eq!(d.records().await.len(), 2);
    }

    #[tokio::test]
    async fn test_orphan_feedback_is_discarded() {
        let d = dispatcher(5_000, 0);
        assert_eq!(d.on_feedback("OK").await, FeedbackDisposition::Orphan);
        assert!(d.records().await.is_empty());

        let pending = d
            .dispatch(&FragmentSpec::new(Phase::Generation, 0, "play 60"), 0)
            .await
            .unwrap();
        d.on_feedback("OK").await;
        pending.outcome().await;

        let before = d.log().await;
        assert_eq!(d.on_feedback("late reply").await, FeedbackDisposition::Orphan);
        assert_eq!(d.log().await, before);
    }

    #[tokio::test]
    async fn test_timeout_forces_failure() {
        let d = dispatcher(50, 0);
        let pending = d
            .dispatch(&FragmentSpec::new(Phase::Generation, 0, "play 60"), 0)
            .await
            .unwrap();
        assert_eq!(pending.timeout(), Duration::from_millis(50));

        assert_eq!(pending.outcome().await, Outcome::timeout());
        assert!(!d.has_outstanding().await);

        // A reply after the forced timeout is an orphan
        assert_eq!(d.on_feedback("OK").await, FeedbackDisposition::Orphan);
        let records = d.records().await;
        assert_eq!(records[0].outcome.failure_message(), Some(TIMEOUT_REASON));
    }

    #[tokio::test]
    async fn test_send_failure_is_logged_and_failed() {
        let d = dispatcher(5_000, 0);
        d.transport().set_failing(true);

        let pending = d
            .dispatch(&FragmentSpec::new(Phase::Generation, 0, "play 60"), 0)
            .await
            .unwrap();
        let outcome = pending.outcome().await;
        assert!(outcome.failure_message().unwrap().starts_with("send failed"));
        assert_eq!(d.records().await.len(), 1);
        assert!(!d.has_outstanding().await);
    }

    #[tokio::test]
    async fn test_force_timeout() {
        let d = dispatcher(5_000, 0);
        assert_eq!(d.force_timeout().await, None);

        let pending = d
            .dispatch(&FragmentSpec::new(Phase::Mixing, 0, "play 60"), 0)
            .await
            .unwrap();
        let id = pending.id();
        assert_eq!(d.force_timeout().await, Some(id));
        assert_eq!(pending.outcome().await, Outcome::timeout());
    }

    /// Play the engine: answer each forwarded message from a script; `None` drops it
    fn spawn_engine(
        dispatcher: Arc<CommandDispatcher<MockTransport>>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<OscMessage>,
        script: Vec<Option<&'static str>>,
    ) {
        tokio::spawn(async move {
            let mut replies = script.into_iter();
            while rx.recv().await.is_some() {
                if let Some(Some(reply)) = replies.next() {
                    dispatcher.on_feedback(reply).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_after_three_attempts() {
        let (transport, rx) = MockTransport::forwarding();
        let d = Arc::new(CommandDispatcher::new(transport, settings(50, 2)));
        spawn_engine(
            Arc::clone(&d),
            rx,
            vec![Some("NameError: zz2 undefined"), None, Some("still broken")],
        );

        let resolution = d
            .dispatch_with_retry(&FragmentSpec::new(Phase::Generation, 0, "play :zz2"))
            .await
            .unwrap();

        assert_eq!(
            resolution,
            DispatchResolution::Exhausted {
                last_error: "still broken".to_string(),
                ids: vec![DispatchId(1), DispatchId(2), DispatchId(3)],
            }
        );

        let records = d.records().await;
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.retry_count).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(records.iter().all(|r| r.fragment.content == "play :zz2"));
        assert_eq!(records[1].outcome, Outcome::timeout());
        assert!(records.iter().all(|r| r.outcome.is_terminal()));
    }

    #[tokio::test]
    async fn test_success_on_second_attempt() {
        let (transport, rx) = MockTransport::forwarding();
        let d = Arc::new(CommandDispatcher::new(transport, settings(5_000, 2)));
        spawn_engine(
            Arc::clone(&d),
            rx,
            vec![Some("NameError: zz2 undefined"), Some("OK")],
        );

        let resolution = d
            .dispatch_with_retry(&FragmentSpec::new(Phase::Generation, 0, "play :zz2"))
            .await
            .unwrap();

        assert_eq!(
            resolution,
            DispatchResolution::Succeeded {
                id: DispatchId(2),
                attempts: 2,
                ids: vec![DispatchId(1), DispatchId(2)],
            }
        );
        let records = d.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].retry_count, 0);
        assert_eq!(records[1].retry_count, 1);
    }

    #[tokio::test]
    async fn test_silence_triggers_automatic_retry() {
        let (transport, rx) = MockTransport::forwarding();
        let d = Arc::new(CommandDispatcher::new(transport, settings(50, 2)));
        spawn_engine(Arc::clone(&d), rx, vec![None, Some("OK")]);

        let resolution = d
            .dispatch_with_retry(&FragmentSpec::new(Phase::Generation, 0, "play 60"))
            .await
            .unwrap();

        assert!(resolution.is_success());
        let records = d.records().await;
        assert_eq!(records[0].outcome, Outcome::timeout());
        assert_eq!(records[1].outcome, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn test_success_token_is_trimmed() {
        let d = dispatcher(5_000, 0);
        assert_eq!(d.classify("OK\n"), Outcome::Succeeded);
        assert_eq!(d.classify("ok"), Outcome::Failed("ok".to_string()));
    }
}
