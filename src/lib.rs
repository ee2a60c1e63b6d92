//! Drives a web page toward a natural-language goal, one decided action at a
//! time.
//!
//! The [`Orchestrator`] alternates between a [`DecisionOracle`] (what to do
//! next) and an [`ExecutionEngine`] (do it on a live browser session obtained
//! through a [`SessionManager`]) until the oracle signals completion, the step
//! budget runs out, or a failure becomes unrecoverable.

pub mod artifacts;
pub mod blocking;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod oracle;
pub mod orchestrator;
pub mod plan;
pub mod retry;
pub mod session;
pub mod types;

pub use artifacts::ArtifactStore;
pub use blocking::BlockingLane;
pub use config::{AgentConfig, OrchestratorConfig};
pub use engine::{ExecutionEngine, StepContext, StepOutcome};
pub use error::{ConnectionError, DecisionError, ExecutionError, FailureKind, ValidationError};
pub use history::{
    History, Observation, RecordedAction, RunResult, RunStatus, StepResult, StepStatus,
    StepSummary,
};
pub use oracle::{DecisionOracle, DecisionRequest};
pub use orchestrator::{Boundary, Orchestrator, RunEvent};
pub use plan::{PlanReplayOracle, TaskPlan};
pub use retry::RetryPolicy;
pub use session::{BrowserConnection, SessionHandle, SessionManager};
pub use types::{Action, ActionDraft, ActionType, Decision, parse_decision};
