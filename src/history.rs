//! Step records, the append-only run history and the run result surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::StepOutcome;
use crate::error::{ExecutionError, FailureKind, ValidationError};
use crate::types::{Action, ActionDraft};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Pending,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Error => "error",
            StepStatus::Pending => "pending",
        }
    }
}

/// A captured snapshot of the page after an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Where the capture is stored (a path or an engine-specific id).
    pub handle: String,
    /// Page URL at capture time.
    pub url: Option<String>,
}

/// What a history entry was about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordedAction {
    /// The action passed validation and reached the execution engine.
    Executed { action: Action },
    /// The oracle proposed something that failed validation.
    Rejected { draft: Option<ActionDraft> },
}

impl RecordedAction {
    pub fn action(&self) -> Option<&Action> {
        match self {
            RecordedAction::Executed { action } => Some(action),
            RecordedAction::Rejected { .. } => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            RecordedAction::Executed { action } => action.action_type().to_string(),
            RecordedAction::Rejected { draft: Some(draft) } => {
                format!("rejected:{}", draft.action_type)
            }
            RecordedAction::Rejected { draft: None } => "rejected".to_string(),
        }
    }
}

/// Outcome of one loop iteration. Never changed once it is in a [`History`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub action: RecordedAction,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    /// Set when a capture was requested but could not be taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StepResult {
    pub fn is_error(&self) -> bool {
        self.status == StepStatus::Error
    }

    /// Whether the action reached the execution engine.
    pub fn was_executed(&self) -> bool {
        matches!(self.action, RecordedAction::Executed { .. })
    }

    /// Compact form handed to the decision oracle.
    pub fn summary(&self) -> StepSummary {
        let action = self.action.action();
        StepSummary {
            step_index: self.step_index,
            action_type: self.action.label(),
            target_description: action
                .map(|a| a.target_description().to_string())
                .unwrap_or_default(),
            value: action.and_then(|a| a.value()).map(String::from),
            expected_state_change: action
                .map(|a| a.expected_state_change().to_string())
                .unwrap_or_default(),
            status: self.status,
            error_message: self.error_message.clone(),
            url: self.observation.as_ref().and_then(|o| o.url.clone()),
        }
    }
}

/// What the oracle sees of a past step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_index: usize,
    pub action_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expected_state_change: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Ordered, append-only record of a run.
///
/// Indices are assigned here, so `entries()[i].step_index == i + 1` always
/// holds. Entries are only ever handed out by shared reference.
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<StepResult>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[StepResult] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&StepResult> {
        self.entries.last()
    }

    /// Number of entries whose action reached the execution engine.
    pub fn executed_count(&self) -> usize {
        self.entries.iter().filter(|s| s.was_executed()).count()
    }

    /// Record what the execution engine reported for `action`.
    pub fn record_outcome(&mut self, action: Action, outcome: StepOutcome) -> &StepResult {
        let StepOutcome {
            status,
            error_message,
            observation,
            capture_error,
        } = outcome;
        let error_message = match status {
            StepStatus::Error => {
                Some(error_message.unwrap_or_else(|| "execution failed without a message".into()))
            }
            _ => None,
        };
        self.push(
            RecordedAction::Executed { action },
            status,
            error_message,
            observation,
            capture_error,
        )
    }

    /// Record an execution error raised by the engine.
    pub fn record_execution_error(
        &mut self,
        action: Action,
        error: &ExecutionError,
    ) -> &StepResult {
        self.push(
            RecordedAction::Executed { action },
            StepStatus::Error,
            Some(format!("[{}] {}", error.kind(), error)),
            None,
            None,
        )
    }

    /// Record a synthetic failed step for an action that never ran.
    pub fn record_rejected(
        &mut self,
        draft: Option<ActionDraft>,
        error: &ValidationError,
    ) -> &StepResult {
        self.push(
            RecordedAction::Rejected { draft },
            StepStatus::Error,
            Some(error.to_string()),
            None,
            None,
        )
    }

    fn push(
        &mut self,
        action: RecordedAction,
        status: StepStatus,
        error_message: Option<String>,
        observation: Option<Observation>,
        capture_error: Option<String>,
    ) -> &StepResult {
        let step_index = self.entries.len() + 1;
        self.entries.push(StepResult {
            step_index,
            action,
            status,
            error_message,
            observation,
            capture_error,
            recorded_at: Utc::now(),
        });
        &self.entries[step_index - 1]
    }

    pub fn into_entries(self) -> Vec<StepResult> {
        self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Exhausted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Exhausted => "exhausted",
        }
    }
}

/// What a finished run hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub task: String,
    pub final_status: RunStatus,
    /// Steps whose action reached the execution engine.
    pub step_count: usize,
    pub history: Vec<StepResult>,
    pub failure_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Summary the oracle gave with its completion signal, if any.
    pub completion_summary: Option<String>,
    pub current_url: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// One line per step, followed by an indented error line for failed ones.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.history.len() + 1);
        for step in &self.history {
            lines.push(format!(
                "Step {:02} {}: {}",
                step.step_index,
                step.action.label().to_uppercase(),
                step.status.as_str()
            ));
            if let Some(err) = &step.error_message {
                lines.push(format!("  Error: {err}"));
            }
        }
        let mut last = format!(
            "Run {} after {} executed step(s)",
            self.final_status.as_str(),
            self.step_count
        );
        if let Some(reason) = &self.failure_reason {
            last.push_str(&format!(": {reason}"));
        }
        lines.push(last);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionDraft;

    fn navigate() -> Action {
        Action::try_from(ActionDraft::new("navigate").value("https://example.com")).unwrap()
    }

    #[test]
    fn test_indices_follow_insertion_order() {
        let mut history = History::new();
        history.record_outcome(navigate(), StepOutcome::success());
        history.record_rejected(None, &ValidationError::Undecodable("not json".into()));
        history.record_execution_error(navigate(), &ExecutionError::Timeout("30s".into()));

        let indices: Vec<usize> = history.entries().iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(history.executed_count(), 2);
    }

    #[test]
    fn test_error_message_present_iff_error() {
        let mut history = History::new();
        let ok = StepOutcome {
            error_message: Some("stray".into()),
            ..StepOutcome::success()
        };
        assert!(history.record_outcome(navigate(), ok).error_message.is_none());

        let failed = StepOutcome {
            status: StepStatus::Error,
            ..StepOutcome::success()
        };
        assert!(history.record_outcome(navigate(), failed).error_message.is_some());
    }

    #[test]
    fn test_execution_error_is_classified() {
        let mut history = History::new();
        let step = history.record_execution_error(
            navigate(),
            &ExecutionError::ElementNotFound("Save button".into()),
        );
        assert_eq!(step.status, StepStatus::Error);
        assert_eq!(
            step.error_message.as_deref(),
            Some("[element-not-found] element not found: Save button")
        );
    }

    #[test]
    fn test_summary_carries_observation_url() {
        let mut history = History::new();
        let outcome = StepOutcome::success().with_observation(Observation {
            handle: "screenshots/step_01.png".into(),
            url: Some("https://example.com/".into()),
        });
        let summary = history.record_outcome(navigate(), outcome).summary();
        assert_eq!(summary.action_type, "navigate");
        assert_eq!(summary.value.as_deref(), Some("https://example.com"));
        assert_eq!(summary.url.as_deref(), Some("https://example.com/"));
    }

    #[test]
    fn test_rejected_label() {
        let mut history = History::new();
        let step = history.record_rejected(
            Some(ActionDraft::new("click")),
            &ValidationError::MissingField {
                action_type: "click".into(),
                field: "target_description",
            },
        );
        assert_eq!(step.action.label(), "rejected:click");
        assert!(!step.was_executed());
    }
}
