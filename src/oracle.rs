use async_trait::async_trait;

use crate::error::DecisionError;
use crate::history::{Observation, StepResult};
use crate::types::Decision;

/// Everything an oracle gets to see for one decision.
///
/// Built fresh for every call; the oracle keeps no session state of its own.
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub task: &'a str,
    pub history: &'a [StepResult],
    pub current_url: Option<&'a str>,
    pub latest_observation: Option<&'a Observation>,
}

/// Chooses the next action, or signals that the task is complete.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide_next_action(
        &self,
        request: DecisionRequest<'_>,
    ) -> Result<Decision, DecisionError>;
}
