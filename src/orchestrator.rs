//! The plan → execute → record → evaluate loop.
//!
//! One run is strictly sequential: a single action is planned, executed on a
//! freshly wired session handle, and recorded before the next one is planned.
//! Every failure is folded into the returned [`RunResult`]; the loop itself
//! never panics or aborts the process.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::engine::{ExecutionEngine, StepContext, StepOutcome};
use crate::error::{ConnectionError, DecisionError, ExecutionError, FailureKind, ValidationError};
use crate::history::{History, Observation, RunResult, RunStatus, StepSummary};
use crate::oracle::{DecisionOracle, DecisionRequest};
use crate::session::{BrowserConnection, SessionManager};
use crate::types::{Action, ActionDraft, ActionType, Decision};

/// Consecutive planning failures that end a run.
const MAX_CONSECUTIVE_PLANNING_FAILURES: u32 = 2;

/// Which retryable boundary a retry happened at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Decision,
    Connection,
    Execution,
}

/// Progress notifications published while a run is in flight.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        task: String,
    },
    Planning {
        next_step: usize,
    },
    Retrying {
        boundary: Boundary,
        retry: u32,
        delay_ms: u64,
        error: String,
    },
    PlanRejected {
        step_index: usize,
        reason: String,
    },
    StepRecorded {
        step: StepSummary,
    },
    Finished {
        status: RunStatus,
        step_count: usize,
        failure_reason: Option<String>,
        summary: Option<String>,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Started { .. } => "started",
            RunEvent::Planning { .. } => "planning",
            RunEvent::Retrying { .. } => "retrying",
            RunEvent::PlanRejected { .. } => "plan_rejected",
            RunEvent::StepRecorded { .. } => "step_recorded",
            RunEvent::Finished { .. } => "finished",
        }
    }
}

enum Phase {
    Init,
    Plan,
    Execute(Action),
    Record(Action, Result<StepOutcome, ExecutionError>),
    Evaluate,
    Done,
}

/// Working memory of one run. Only the orchestrator touches it.
struct RunState {
    task: String,
    history: History,
    current_url: Option<String>,
    latest_observation: Option<Observation>,
    status: RunStatus,
    executed: usize,
    consecutive_execution_errors: u32,
    consecutive_planning_failures: u32,
    failure: Option<(FailureKind, String)>,
    completion_summary: Option<String>,
}

impl RunState {
    fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            history: History::new(),
            current_url: None,
            latest_observation: None,
            status: RunStatus::Running,
            executed: 0,
            consecutive_execution_errors: 0,
            consecutive_planning_failures: 0,
            failure: None,
            completion_summary: None,
        }
    }

    fn complete(&mut self, summary: Option<String>) -> Phase {
        self.status = RunStatus::Completed;
        self.completion_summary = summary;
        Phase::Done
    }

    fn exhaust(&mut self) -> Phase {
        self.status = RunStatus::Exhausted;
        Phase::Done
    }

    fn fail(&mut self, kind: FailureKind, reason: String) -> Phase {
        self.status = RunStatus::Failed;
        self.failure = Some((kind, reason));
        Phase::Done
    }
}

/// Drives one task at a time against a decision oracle and a browser.
///
/// The session manager (and with it the browser connection) outlives runs, so
/// consecutive tasks share the same browser process.
pub struct Orchestrator<O, C, E>
where
    C: BrowserConnection,
{
    oracle: O,
    sessions: SessionManager<C>,
    engine: E,
    config: OrchestratorConfig,
    events: Option<broadcast::Sender<RunEvent>>,
    cancel: CancellationToken,
}

impl<O, C, E> Orchestrator<O, C, E>
where
    O: DecisionOracle,
    C: BrowserConnection,
    E: ExecutionEngine<C::Handle>,
{
    pub fn new(oracle: O, connection: C, engine: E, config: OrchestratorConfig) -> Self {
        Self {
            oracle,
            sessions: SessionManager::new(connection),
            engine,
            config,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Publish [`RunEvent`]s on this channel.
    pub fn with_events(mut self, events: broadcast::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the token checked between steps.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Token checked between steps of the next run.
    ///
    /// A cancellation applies to one run only: once a run has ended with the
    /// token cancelled, the orchestrator swaps in a fresh one, so fetch the
    /// token again before each run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn sessions(&self) -> &SessionManager<C> {
        &self.sessions
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run `task` to a terminal state and return everything that happened.
    pub async fn run(&mut self, task: &str) -> RunResult {
        let started_at = Utc::now();
        let mut state = RunState::new(task);
        info!(task, max_steps = self.config.max_steps, "Starting run");
        self.emit(RunEvent::Started {
            task: task.to_string(),
        });

        let mut phase = Phase::Init;
        loop {
            phase = match phase {
                Phase::Init => self.init(&mut state).await,
                Phase::Plan => self.plan(&mut state).await,
                Phase::Execute(action) => self.execute(&mut state, action).await,
                Phase::Record(action, outcome) => self.record(&mut state, action, outcome),
                Phase::Evaluate => self.evaluate(&mut state).await,
                Phase::Done => break,
            };
        }

        self.sessions.release().await;
        if self.cancel.is_cancelled() {
            debug!("Cancellation consumed, resetting token for the next run");
            self.cancel = CancellationToken::new();
        }
        self.finish(state, started_at)
    }

    async fn init(&mut self, state: &mut RunState) -> Phase {
        if self.config.max_steps == 0 {
            info!("Step budget is zero, nothing to do");
            return state.exhaust();
        }
        match self.acquire_with_retry().await {
            Ok(()) => Phase::Plan,
            Err(reason) => state.fail(FailureKind::Connection, reason),
        }
    }

    async fn plan(&mut self, state: &mut RunState) -> Phase {
        let next_step = state.history.len() + 1;
        debug!(next_step, "Planning");
        self.emit(RunEvent::Planning { next_step });

        match self.decide_with_retry(state).await {
            Ok(Decision::Complete { summary }) => {
                info!(summary = summary.as_deref().unwrap_or(""), "Oracle signalled completion");
                state.complete(summary)
            }
            Ok(Decision::Act(draft)) => match Action::try_from(draft.clone()) {
                Ok(action) if action.action_type() == ActionType::Complete => {
                    let summary = Some(action.reasoning().to_string()).filter(|s| !s.is_empty());
                    info!("Oracle signalled completion");
                    state.complete(summary)
                }
                Ok(action) => {
                    state.consecutive_planning_failures = 0;
                    info!(step = next_step, action = %action.describe(), "Oracle decided");
                    Phase::Execute(action)
                }
                Err(e) => self.planning_failure(state, Some(draft), e),
            },
            Err(DecisionError::Rejected(e)) => self.planning_failure(state, None, e),
            Err(e) => {
                error!(error = %e, "Decision oracle failed");
                state.fail(
                    FailureKind::Decision,
                    format!(
                        "decision oracle failed after {} retries: {e}",
                        self.config.decision_retry_limit
                    ),
                )
            }
        }
    }

    fn planning_failure(
        &self,
        state: &mut RunState,
        draft: Option<ActionDraft>,
        error: ValidationError,
    ) -> Phase {
        let step = state.history.record_rejected(draft, &error);
        let step_index = step.step_index;
        let summary = step.summary();
        warn!(step = step_index, error = %error, "Rejected invalid action from oracle");
        self.emit(RunEvent::PlanRejected {
            step_index,
            reason: error.to_string(),
        });
        self.emit(RunEvent::StepRecorded { step: summary });

        state.consecutive_planning_failures += 1;
        if state.consecutive_planning_failures >= MAX_CONSECUTIVE_PLANNING_FAILURES {
            state.fail(
                FailureKind::Planning,
                format!(
                    "planning failed {} times in a row: {error}",
                    state.consecutive_planning_failures
                ),
            )
        } else {
            Phase::Plan
        }
    }

    async fn execute(&mut self, state: &mut RunState, action: Action) -> Phase {
        if let Err(reason) = self.acquire_with_retry().await {
            warn!(action = %action.describe(), "Dropping planned action, no session");
            return state.fail(FailureKind::Connection, reason);
        }
        let Some(handle) = self.sessions.current() else {
            return state.fail(
                FailureKind::Connection,
                "connection failure: session handle missing after acquisition".into(),
            );
        };

        let limit = self.config.per_call_timeout();
        let ctx = StepContext {
            step_index: state.history.len() + 1,
            task: &state.task,
            budget: limit,
        };
        debug!(
            step = ctx.step_index,
            generation = handle.generation(),
            "Executing action"
        );

        let outcome = match timeout(limit, self.engine.execute(&action, handle, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecutionError::Timeout(format!("no result within {limit:?}"))),
        };
        Phase::Record(action, outcome)
    }

    fn record(
        &self,
        state: &mut RunState,
        action: Action,
        outcome: Result<StepOutcome, ExecutionError>,
    ) -> Phase {
        let step = match outcome {
            Ok(outcome) => state.history.record_outcome(action, outcome),
            Err(e) => state.history.record_execution_error(action, &e),
        };

        if step.is_error() {
            state.consecutive_execution_errors += 1;
            warn!(
                step = step.step_index,
                error = step.error_message.as_deref().unwrap_or(""),
                "Step failed"
            );
        } else {
            state.consecutive_execution_errors = 0;
            info!(step = step.step_index, status = step.status.as_str(), "Step recorded");
        }
        if let Some(capture_error) = &step.capture_error {
            warn!(step = step.step_index, error = %capture_error, "Observation missing");
        }
        // a failed step's page state is not trusted as the new context
        if let Some(observation) = step.observation.as_ref().filter(|_| !step.is_error()) {
            if let Some(url) = &observation.url {
                state.current_url = Some(url.clone());
            }
            state.latest_observation = Some(observation.clone());
        }
        let summary = step.summary();
        state.executed += 1;
        self.emit(RunEvent::StepRecorded { step: summary });
        Phase::Evaluate
    }

    async fn evaluate(&mut self, state: &mut RunState) -> Phase {
        let errors = state.consecutive_execution_errors;
        if errors > self.config.execution_retry_limit {
            return state.fail(
                FailureKind::Execution,
                format!("{errors} consecutive execution errors, giving up"),
            );
        }
        if state.executed >= self.config.max_steps {
            info!(steps = state.executed, "Step budget exhausted");
            return state.exhaust();
        }
        if self.cancel.is_cancelled() {
            info!("Run cancelled between steps");
            return state.fail(FailureKind::Cancelled, "run cancelled by caller".into());
        }
        if errors > 0 {
            let message = state
                .history
                .last()
                .and_then(|s| s.error_message.clone())
                .unwrap_or_default();
            self.backoff(Boundary::Execution, errors, &message).await;
        }
        Phase::Plan
    }

    async fn decide_with_retry(&self, state: &RunState) -> Result<Decision, DecisionError> {
        let policy = self.config.decision_policy();
        let limit = self.config.per_call_timeout();
        let mut retries = 0;
        loop {
            let request = DecisionRequest {
                task: &state.task,
                history: state.history.entries(),
                current_url: state.current_url.as_deref(),
                latest_observation: state.latest_observation.as_ref(),
            };
            let result = match timeout(limit, self.oracle.decide_next_action(request)).await {
                Ok(result) => result,
                Err(_) => Err(DecisionError::Timeout(limit)),
            };
            match result {
                Err(e) if e.is_transient() && policy.allows_retry(retries) => {
                    retries += 1;
                    self.backoff(Boundary::Decision, retries, &e.to_string()).await;
                }
                other => return other,
            }
        }
    }

    /// Acquire a fresh handle, retrying with backoff. On failure, returns the
    /// reason the run cannot continue.
    async fn acquire_with_retry(&mut self) -> Result<(), String> {
        let policy = self.config.connection_policy();
        let limit = self.config.per_call_timeout();
        let mut retries = 0;
        loop {
            let result = match timeout(limit, self.sessions.acquire_handle()).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ConnectionError::Timeout(limit)),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if policy.allows_retry(retries) => {
                    retries += 1;
                    self.backoff(Boundary::Connection, retries, &e.to_string()).await;
                }
                Err(e) => {
                    error!(error = %e, retries, "Could not acquire a session handle");
                    return Err(format!(
                        "connection failure: could not acquire a session handle after {retries} retries: {e}"
                    ));
                }
            }
        }
    }

    async fn backoff(&self, boundary: Boundary, retry: u32, error: &str) {
        let policy = match boundary {
            Boundary::Decision => self.config.decision_policy(),
            Boundary::Connection => self.config.connection_policy(),
            Boundary::Execution => self.config.execution_policy(),
        };
        let delay = policy.delay_for(retry);
        warn!(
            boundary = ?boundary,
            retry,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error,
            "Retrying"
        );
        self.emit(RunEvent::Retrying {
            boundary,
            retry,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        });
        if delay > Duration::ZERO {
            sleep(delay).await;
        }
    }

    fn finish(&self, state: RunState, started_at: chrono::DateTime<Utc>) -> RunResult {
        let (failure_kind, failure_reason) = match state.failure {
            Some((kind, reason)) => (Some(kind), Some(reason)),
            None => (None, None),
        };
        let result = RunResult {
            task: state.task,
            final_status: state.status,
            step_count: state.executed,
            history: state.history.into_entries(),
            failure_reason,
            failure_kind,
            completion_summary: state.completion_summary,
            current_url: state.current_url,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            status = result.final_status.as_str(),
            steps = result.step_count,
            history = result.history.len(),
            "Run finished"
        );
        self.emit(RunEvent::Finished {
            status: result.final_status,
            step_count: result.step_count,
            failure_reason: result.failure_reason.clone(),
            summary: result.completion_summary.clone(),
        });
        result
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
