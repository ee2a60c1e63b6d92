//! The execution side of the loop: perform one action on a live session.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ExecutionError;
use crate::history::{Observation, StepStatus};
use crate::session::SessionHandle;
use crate::types::Action;

/// What the engine reports back for one action.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub observation: Option<Observation>,
    /// A requested capture that could not be taken. Does not fail the step.
    pub capture_error: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            error_message: None,
            observation: None,
            capture_error: None,
        }
    }

    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            ..Self::success()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            error_message: Some(message.into()),
            ..Self::success()
        }
    }

    pub fn with_observation(mut self, observation: Observation) -> Self {
        self.observation = Some(observation);
        self
    }

    pub fn with_capture_error(mut self, error: impl Into<String>) -> Self {
        self.capture_error = Some(error.into());
        self
    }
}

/// Read-only context an engine may use to name artifacts.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Index the resulting history entry will receive.
    pub step_index: usize,
    pub task: &'a str,
    /// Time the orchestrator waits for this call. Internal waits should end
    /// within it; work still running past it delays the next action.
    pub budget: Duration,
}

/// Performs actions against a session handle of type `H`.
///
/// Called at most once per action and never concurrently within a run. A
/// timed-out call is dropped, so engines that hand work to other threads must
/// finish it before starting the next action (see
/// [`BlockingLane`](crate::blocking::BlockingLane)). When
/// `action.wants_observation()` the engine must attempt a capture and report
/// a failed capture through [`StepOutcome::capture_error`].
#[async_trait]
pub trait ExecutionEngine<H>: Send + Sync
where
    H: Send + Sync,
{
    async fn execute(
        &self,
        action: &Action,
        handle: &SessionHandle<H>,
        ctx: StepContext<'_>,
    ) -> Result<StepOutcome, ExecutionError>;
}
