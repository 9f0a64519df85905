use crate::action::Action;
use crate::browser::PageHandle;
use crate::desktop::Desktop;
use crate::error::{ActionError, AgentError};
use crate::escalation::{EscalationLadder, EscalationOutcome, EscalationRequest, FailureCounter};
use crate::executor::Executor;
use crate::history::{EscalationPath, ExecutedAction, RunHistory, StepOutcome, StepRecord};
use crate::observer::{ObserverConfig, StateObserver};
use crate::ocr::TextExtractor;
use crate::planner::{validate_plan, PlanDraft, PlanStep, Planner, PlannerInput, DEFAULT_APP_KNOWLEDGE};
use crate::recorder::{NullRunSink, RunSink};
use crate::snapshot::{now_ms, Snapshot};
use crate::verify::{AnchorMatch, AnchorVerifier, VerifierConfig};
use crate::vision::Vision;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ========================= Task Boundary =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub goal: String,
    pub max_steps: usize,
    pub run_id: String,
}

impl Task {
    pub fn new(goal: impl Into<String>, max_steps: usize) -> Result<Self, AgentError> {
        let goal = goal.into();
        if goal.trim().is_empty() {
            return Err(AgentError::InvalidTask("goal must not be empty".into()));
        }
        if max_steps < 1 {
            return Err(AgentError::InvalidTask("max_steps must be at least 1".into()));
        }
        Ok(Self { goal, max_steps, run_id: nanoid!() })
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

/// Produced exactly once per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub steps_taken: usize,
    pub final_answer: Option<String>,
    pub error: Option<String>,
    pub run_id: String,
}

/// A finished run with the history that produced it.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub result: TaskResult,
    pub history: RunHistory,
    pub consecutive_failures: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Observing,
    QuickCheck,
    Deciding,
    Executing,
    Verifying,
    Escalating,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Observing => "observing",
            Phase::QuickCheck => "quick_check",
            Phase::Deciding => "deciding",
            Phase::Executing => "executing",
            Phase::Verifying => "verifying",
            Phase::Escalating => "escalating",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// ========================= Configuration =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Local executions of one plan before escalating.
    pub max_attempts: usize,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Pause between local attempts.
    pub retry_backoff: Duration,
    /// Consecutive unresolved steps after which vision is forced.
    pub forced_vision_threshold: usize,
    /// History lines handed to the planner.
    pub history_window: usize,
    pub max_plan_actions: usize,
    pub capture_screenshots: bool,
    pub app_knowledge: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1500),
            forced_vision_threshold: 3,
            history_window: 8,
            max_plan_actions: 8,
            capture_screenshots: true,
            app_knowledge: DEFAULT_APP_KNOWLEDGE.to_string(),
        }
    }
}

impl AgentConfig {
    /// Reject budgets the loop cannot run with.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_attempts == 0 {
            return Err(AgentError::Config("max_attempts must be at least 1".into()));
        }
        if self.max_plan_actions == 0 {
            return Err(AgentError::Config("max_plan_actions must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(AgentError::Config("poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Seconds from the command line or env as a `Duration`.
pub fn duration_from_secs(name: &str, secs: f64) -> Result<Duration, AgentError> {
    Duration::try_from_secs_f64(secs).map_err(|e| AgentError::Config(format!("{name}: {e} ({secs})")))
}

// ========================= Agent Core =========================

/// Run-scoped mutable state; owned by one `run` call.
#[derive(Default)]
struct RunState {
    history: RunHistory,
    failures: FailureCounter,
    prev_anchor: String,
    prev_indicators: Vec<String>,
}

enum AttemptEnd {
    /// Every action ran without error.
    Clean,
    Failed,
    Done(Option<String>),
    Fail(String),
    Cancelled,
}

enum Verification {
    Matched(Option<AnchorMatch>, Snapshot),
    Missed(Snapshot),
    Cancelled,
}

pub struct Agent<P, D>
where
    P: Planner,
    D: Desktop,
{
    planner: P,
    desktop: D,
    cfg: AgentConfig,
    page: Option<Arc<dyn PageHandle>>,
    observer: StateObserver,
    executor: Executor,
    verifier: AnchorVerifier,
    vision: Option<Arc<dyn Vision>>,
    text_extractor: Option<Arc<dyn TextExtractor>>,
    sink: Arc<dyn RunSink>,
}

impl<P, D> Agent<P, D>
where
    P: Planner,
    D: Desktop,
{
    pub fn new(planner: P, desktop: D, cfg: AgentConfig) -> Self {
        Self {
            planner,
            desktop,
            cfg,
            page: None,
            observer: StateObserver::new(ObserverConfig::default(), None),
            executor: Executor::new(None),
            verifier: AnchorVerifier::default(),
            vision: None,
            text_extractor: None,
            sink: Arc::new(NullRunSink),
        }
    }

    /// The page both the observer and the executor address elements on.
    pub fn with_browser(mut self, page: Arc<dyn PageHandle>) -> Self {
        self.page = Some(page);
        self.observer = StateObserver::new(self.observer.config().clone(), self.page.clone());
        self.executor = Executor::new(self.page.clone());
        self
    }

    pub fn with_observer_config(mut self, cfg: ObserverConfig) -> Self {
        self.observer = StateObserver::new(cfg, self.page.clone());
        self
    }

    pub fn with_verifier_config(mut self, cfg: VerifierConfig) -> Self {
        self.verifier = AnchorVerifier::new(cfg);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn Vision>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_text_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.text_extractor = Some(extractor);
        self
    }

    pub fn with_run_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Drive `task` to a terminal state. Never fails; every outcome is a `TaskResult`.
    pub async fn run(&self, task: &Task, cancel: &CancellationToken) -> TaskResult {
        self.run_report(task, cancel).await.result
    }

    pub async fn run_report(&self, task: &Task, cancel: &CancellationToken) -> RunReport {
        info!(run_id = %task.run_id, goal = %task.goal, max_steps = task.max_steps, "run started");
        let mut state = RunState::default();
        let result = self.drive(task, &mut state, cancel).await;
        if let Err(e) = self.sink.finish(&task.run_id, task, &result).await {
            warn!(run_id = %task.run_id, error = %e, "run sink failed to finish");
        }
        info!(
            run_id = %task.run_id,
            success = result.success,
            steps = result.steps_taken,
            error = ?result.error,
            "run finished"
        );
        RunReport { result, history: state.history, consecutive_failures: state.failures.get() }
    }

    async fn drive(&self, task: &Task, state: &mut RunState, cancel: &CancellationToken) -> TaskResult {
        let finish = |success: bool, steps_taken: usize, final_answer: Option<String>, error: Option<String>| TaskResult {
            success,
            steps_taken,
            final_answer,
            error,
            run_id: task.run_id.clone(),
        };
        let cancelled = |steps: usize| finish(false, steps, None, Some(AgentError::Cancelled.to_string()));

        for step in 1..=task.max_steps {
            if cancel.is_cancelled() {
                return cancelled(step - 1);
            }

            // Observe
            debug!(step, phase = %Phase::Observing);
            let snap = self.observer.observe(&self.desktop).await;
            let screenshot = self.capture().await;
            let screenshot_ref = match (&screenshot, self.cfg.capture_screenshots) {
                (Some(png), true) => match self.sink.save_screenshot(&task.run_id, step, png).await {
                    Ok(r) => Some(r),
                    Err(e) => {
                        warn!(step, error = %e, "screenshot not stored");
                        None
                    }
                },
                _ => None,
            };

            // Quick completion check against the previous step's expectation
            if !state.prev_indicators.is_empty() {
                debug!(step, phase = %Phase::QuickCheck, anchor = %state.prev_anchor);
                let text = self.screen_text(screenshot.as_deref()).await;
                if self.verifier.is_complete(&snap, &state.prev_anchor, &state.prev_indicators, text.as_deref()) {
                    let msg = format!(
                        "Goal reached (anchor '{}', indicators {:?})",
                        state.prev_anchor, state.prev_indicators
                    );
                    info!(step, phase = %Phase::Done, "{msg}");
                    return finish(true, step, Some(msg), None);
                }
            }

            // Decide
            let history_lines = state.history.planner_lines(self.cfg.history_window);
            let input = PlannerInput {
                goal: &task.goal,
                step,
                history: &history_lines,
                snapshot: &snap,
                app_knowledge: &self.cfg.app_knowledge,
            };
            debug!(step, phase = %Phase::Deciding);
            let draft = tokio::select! {
                _ = cancel.cancelled() => return cancelled(step - 1),
                d = self.planner.decide(&input) => d,
            };
            let draft = draft.unwrap_or_else(|e| {
                warn!(step, error = %e, "planner failed; treating as an empty plan");
                PlanDraft::default()
            });
            let plan = self.prepare_plan(step, draft, &snap);
            info!(
                step,
                actions = %plan.actions.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
                anchor = %plan.anchor(),
                indicators = ?plan.success_indicators,
                "plan"
            );
            state.prev_anchor = plan.anchor().to_string();
            state.prev_indicators = plan.success_indicators.clone();

            // Execute and verify, with local retry
            let mut executed = Vec::new();
            let mut verified: Option<(Option<AnchorMatch>, Snapshot)> = None;
            let mut last_seen: Option<Snapshot> = None;
            if plan.actions.is_empty() {
                info!(step, "empty plan; escalating");
            } else {
                for attempt in 1..=self.cfg.max_attempts {
                    let end = self.execute_sequence(step, attempt, &plan, &snap, &mut executed, cancel).await;
                    let (clean, terminal) = match end {
                        AttemptEnd::Cancelled => return cancelled(step - 1),
                        AttemptEnd::Clean => (true, None),
                        AttemptEnd::Failed => (false, None),
                        AttemptEnd::Done(answer) => (true, Some((StepOutcome::Done, finish(true, step, answer, None)))),
                        AttemptEnd::Fail(error) => {
                            (false, Some((StepOutcome::Failed, finish(false, step, None, Some(error)))))
                        }
                    };
                    if let Some((outcome, result)) = terminal {
                        info!(step, phase = %Phase::Done, success = result.success, "terminal action");
                        let record = self.step_record(step, plan, executed, outcome, None, &EscalationOutcome::default(), screenshot_ref, &snap);
                        self.append(task, state, record).await;
                        return result;
                    }

                    match self.verify_step(step, attempt, plan.anchor(), clean, cancel).await {
                        Verification::Cancelled => return cancelled(step - 1),
                        Verification::Matched(rule, latest) => {
                            verified = Some((rule, latest));
                            break;
                        }
                        Verification::Missed(latest) => {
                            last_seen = Some(latest);
                            if attempt < self.cfg.max_attempts {
                                tokio::select! {
                                    _ = cancel.cancelled() => return cancelled(step - 1),
                                    _ = sleep(self.cfg.retry_backoff) => {}
                                }
                            }
                        }
                    }
                }
            }

            if let Some((rule, latest)) = verified {
                state.failures.reset();
                let complete = plan.claims_completion() && {
                    let text = self.screen_text(None).await;
                    self.verifier.is_complete(&latest, plan.anchor(), &plan.success_indicators, text.as_deref())
                };
                let outcome = if complete { StepOutcome::Completed } else { StepOutcome::Verified };
                info!(step, rule = ?rule, complete, "step verified");
                let msg = complete.then(|| {
                    format!("Goal reached (anchor '{}', indicators {:?})", plan.anchor(), plan.success_indicators)
                });
                let record = self.step_record(step, plan, executed, outcome, rule, &EscalationOutcome::default(), screenshot_ref, &latest);
                self.append(task, state, record).await;
                if let Some(msg) = msg {
                    return finish(true, step, Some(msg), None);
                }
                continue;
            }

            // Escalate
            debug!(step, phase = %Phase::Escalating, failures = state.failures.get());
            let history_lines = state.history.planner_lines(self.cfg.history_window);
            let current = last_seen.unwrap_or(snap);
            let ladder = EscalationLadder {
                observer: &self.observer,
                executor: &self.executor,
                verifier: &self.verifier,
                vision: self.vision.as_deref(),
                forced_threshold: self.cfg.forced_vision_threshold,
            };
            let req = EscalationRequest {
                step,
                goal: &task.goal,
                anchor: plan.anchor(),
                indicators: &plan.success_indicators,
                snapshot: &current,
                history: &history_lines,
            };
            let escalation = ladder.escalate(&self.desktop, &req, &state.failures, cancel).await;
            let outcome = if escalation.resolved {
                state.failures.reset();
                StepOutcome::Resolved
            } else {
                let n = state.failures.increment();
                warn!(step, consecutive_failures = n, path = ?escalation.path, "step unresolved");
                StepOutcome::Unresolved
            };
            let record = self.step_record(step, plan, executed, outcome, None, &escalation, screenshot_ref, &current);
            self.append(task, state, record).await;
            if cancel.is_cancelled() {
                return cancelled(step);
            }
        }

        let err = AgentError::BudgetExhausted { max_steps: task.max_steps };
        info!(phase = %Phase::Aborted, "{err}");
        finish(false, task.max_steps, None, Some(err.to_string()))
    }

    fn prepare_plan(&self, step: usize, draft: PlanDraft, snap: &Snapshot) -> PlanStep {
        let mut plan = PlanStep::from_draft(draft, self.cfg.max_plan_actions);
        for r in &plan.rejected {
            let e = AgentError::PlanParse(r.reason.clone());
            warn!(step, token = %r.token, error = %e, "dropped plan token");
        }
        if plan.truncated > 0 {
            warn!(step, dropped = plan.truncated, max = self.cfg.max_plan_actions, "plan longer than allowed; truncated");
        }
        let violations = validate_plan(&plan, snap);
        if let Some(cut) = violations.iter().map(|v| v.position()).min() {
            warn!(step, violations = ?violations, cut_at = cut, "plan violates addressing rules; truncating");
            plan.actions.truncate(cut);
        }
        plan.violations = violations;
        plan
    }

    async fn execute_sequence(
        &self,
        step: usize,
        attempt: usize,
        plan: &PlanStep,
        snap: &Snapshot,
        executed: &mut Vec<ExecutedAction>,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        debug!(step, attempt, phase = %Phase::Executing);
        for action in &plan.actions {
            match action {
                Action::Done { final_answer } => {
                    executed.push(ExecutedAction { attempt, action: action.clone(), error: None });
                    return AttemptEnd::Done(final_answer.clone());
                }
                Action::Fail { error } => {
                    executed.push(ExecutedAction { attempt, action: action.clone(), error: None });
                    return AttemptEnd::Fail(error.clone());
                }
                _ => {}
            }
            match self.executor.execute(&self.desktop, action, snap, cancel).await {
                Ok(()) => executed.push(ExecutedAction { attempt, action: action.clone(), error: None }),
                Err(ActionError::Cancelled) => return AttemptEnd::Cancelled,
                Err(e) => {
                    let e = AgentError::ActionExecution(e);
                    warn!(step, attempt, action = %action, error = %e, "action failed");
                    executed.push(ExecutedAction { attempt, action: action.clone(), error: Some(e.to_string()) });
                    return AttemptEnd::Failed;
                }
            }
        }
        AttemptEnd::Clean
    }

    /// Poll the anchor on fresh snapshots until it matches or the window closes.
    /// A blank anchor verifies a clean attempt after a single observe.
    async fn verify_step(
        &self,
        step: usize,
        attempt: usize,
        anchor: &str,
        clean: bool,
        cancel: &CancellationToken,
    ) -> Verification {
        debug!(step, attempt, phase = %Phase::Verifying, anchor);
        if anchor.trim().is_empty() {
            let snap = self.observer.observe(&self.desktop).await;
            return if clean { Verification::Matched(None, snap) } else { Verification::Missed(snap) };
        }
        let deadline = Instant::now() + self.cfg.poll_timeout;
        loop {
            let snap = self.observer.observe(&self.desktop).await;
            if let Some(rule) = self.verifier.match_anchor(&snap, anchor) {
                return Verification::Matched(Some(rule), snap);
            }
            let now = Instant::now();
            if now >= deadline {
                let e = AgentError::VerificationTimeout {
                    anchor: anchor.to_string(),
                    waited_ms: self.cfg.poll_timeout.as_millis(),
                };
                warn!(step, attempt, title = %snap.window_title, url = ?snap.url(), error = %e, "anchor mismatch");
                return Verification::Missed(snap);
            }
            let nap = self.cfg.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Verification::Cancelled,
                _ = sleep(nap) => {}
            }
        }
    }

    async fn capture(&self) -> Option<Vec<u8>> {
        if !self.cfg.capture_screenshots && self.text_extractor.is_none() {
            return None;
        }
        match self.desktop.screenshot().await {
            Ok(png) => Some(png),
            Err(e) => {
                warn!(error = %e, "screenshot failed");
                None
            }
        }
    }

    /// OCR text of `png`, or of a fresh screenshot, when an extractor is configured.
    async fn screen_text(&self, png: Option<&[u8]>) -> Option<String> {
        let extractor = self.text_extractor.as_ref()?;
        let fresh;
        let png = match png {
            Some(p) => p,
            None => {
                fresh = self.desktop.screenshot().await.ok()?;
                fresh.as_slice()
            }
        };
        match extractor.extract(png).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "text extraction failed");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_record(
        &self,
        step: usize,
        plan: PlanStep,
        executed: Vec<ExecutedAction>,
        outcome: StepOutcome,
        anchor_match: Option<AnchorMatch>,
        escalation: &EscalationOutcome,
        screenshot_ref: Option<String>,
        snap: &Snapshot,
    ) -> StepRecord {
        StepRecord {
            step,
            plan,
            executed,
            outcome,
            anchor_match,
            escalation: if outcome == StepOutcome::Resolved || outcome == StepOutcome::Unresolved {
                escalation.path
            } else {
                EscalationPath::None
            },
            vision_action: escalation.vision_action.clone(),
            screenshot_ref,
            snapshot_id: snap.id.clone(),
            timestamp_ms: now_ms(),
        }
    }

    async fn append(&self, task: &Task, state: &mut RunState, record: StepRecord) {
        let idx = state.history.push(record);
        if let Some(r) = state.history.get(idx) {
            if let Err(e) = self.sink.record(&task.run_id, r.step, r.screenshot_ref.as_deref(), r).await {
                warn!(step = r.step, error = %e, "run sink failed to record step");
            }
        }
    }
}
