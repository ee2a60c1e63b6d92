//! Whole-task plans and replaying them through the loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DecisionError, ValidationError};
use crate::oracle::{DecisionOracle, DecisionRequest};
use crate::types::{Action, ActionDraft, Decision};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

/// Untrusted plan as produced by an oracle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanDraft {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<ActionDraft>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub potential_issues: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub estimated_complexity: Complexity,
}

/// A validated, ordered plan for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal: String,
    pub steps: Vec<Action>,
    pub assumptions: Vec<String>,
    pub potential_issues: Vec<String>,
    pub success_criteria: Vec<String>,
    pub estimated_complexity: Complexity,
}

impl TaskPlan {
    /// Validate every step. The first invalid step rejects the whole plan.
    ///
    /// A `complete` step ends the plan; anything after it is dropped. An empty
    /// goal falls back to `task`.
    pub fn from_draft(draft: PlanDraft, task: &str) -> Result<Self, PlanError> {
        let mut steps = Vec::with_capacity(draft.steps.len());
        for (i, step) in draft.steps.into_iter().enumerate() {
            let action = Action::try_from(step).map_err(|source| PlanError {
                step: i + 1,
                source,
            })?;
            if action.action_type() == crate::types::ActionType::Complete {
                break;
            }
            steps.push(action);
        }
        let goal = if draft.goal.trim().is_empty() {
            task.to_string()
        } else {
            draft.goal
        };
        Ok(TaskPlan {
            goal,
            steps,
            assumptions: draft.assumptions,
            potential_issues: draft.potential_issues,
            success_criteria: draft.success_criteria,
            estimated_complexity: draft.estimated_complexity,
        })
    }

    /// Parse an oracle reply (optionally fenced JSON) into a plan.
    pub fn parse(raw: &str, task: &str) -> Result<Self, PlanError> {
        let cleaned = raw
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        let draft: PlanDraft = serde_json::from_str(cleaned).map_err(|e| PlanError {
            step: 0,
            source: ValidationError::Undecodable(e.to_string()),
        })?;
        Self::from_draft(draft, task)
    }

    /// Human-readable listing of the plan.
    pub fn render(&self) -> String {
        let mut out = format!(
            "GOAL: {}\nComplexity: {:?}\n",
            self.goal, self.estimated_complexity
        );
        let sections = [
            ("Assumptions", &self.assumptions),
            ("Potential issues", &self.potential_issues),
            ("Success criteria", &self.success_criteria),
        ];
        for (title, items) in sections {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{title}:\n"));
            for item in items {
                out.push_str(&format!("  - {item}\n"));
            }
        }
        out.push_str(&format!("\nPlan ({} steps):\n", self.steps.len()));
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("  {}. {}", i + 1, step.describe()));
            if step.capture_after() {
                out.push_str(" [capture]");
            }
            out.push('\n');
            if !step.expected_state_change().is_empty() {
                out.push_str(&format!("     expect: {}\n", step.expected_state_change()));
            }
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid plan (step {step}): {source}")]
pub struct PlanError {
    /// 1-based index of the offending step; 0 when the plan itself is undecodable.
    pub step: usize,
    #[source]
    pub source: ValidationError,
}

/// Replays a fixed plan as if an oracle were choosing each step.
///
/// The next step is picked from the number of executed entries in history,
/// so repeated calls with the same history give the same answer. Once every
/// step has run, the completion signal is returned.
#[derive(Debug, Clone)]
pub struct PlanReplayOracle {
    plan: TaskPlan,
}

impl PlanReplayOracle {
    pub fn new(plan: TaskPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &TaskPlan {
        &self.plan
    }
}

#[async_trait]
impl DecisionOracle for PlanReplayOracle {
    async fn decide_next_action(
        &self,
        request: DecisionRequest<'_>,
    ) -> Result<Decision, DecisionError> {
        let executed = request.history.iter().filter(|s| s.was_executed()).count();
        Ok(match self.plan.steps.get(executed) {
            Some(action) => Decision::Act(ActionDraft::from(action.clone())),
            None => Decision::Complete {
                summary: Some(format!("Executed all {} planned steps", self.plan.steps.len())),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN_JSON: &str = r#"{
        "goal": "Create a new project in Linear",
        "steps": [
            {"action_type": "navigate", "target_description": "", "value": "https://linear.app"},
            {"action_type": "click", "target_description": "New project button", "capture_after": true},
            {"action_type": "type", "target_description": "Project name field", "value": "Apollo"},
            {"action_type": "complete", "target_description": ""},
            {"action_type": "wait", "target_description": ""}
        ],
        "assumptions": ["User is logged in"],
        "estimated_complexity": "simple"
    }"#;

    #[test]
    fn test_parse_plan() {
        let plan = TaskPlan::parse(PLAN_JSON, "ignored").unwrap();
        assert_eq!(plan.goal, "Create a new project in Linear");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.estimated_complexity, Complexity::Simple);
        assert!(plan.steps[1].capture_after());

        let rendered = plan.render();
        assert!(rendered.contains("2. click New project button [capture]"));
        assert!(rendered.contains("User is logged in"));
    }

    #[test]
    fn test_invalid_step_rejects_plan() {
        let raw = r#"{"goal":"g","steps":[{"action_type":"wait"},{"action_type":"type","target_description":"box"}]}"#;
        let err = TaskPlan::parse(raw, "g").unwrap_err();
        assert_eq!(err.step, 2);
        assert!(matches!(err.source, ValidationError::MissingField { field: "value", .. }));
    }

    #[test]
    fn test_empty_goal_falls_back_to_task() {
        let plan = TaskPlan::parse(r#"{"steps":[]}"#, "do the thing").unwrap();
        assert_eq!(plan.goal, "do the thing");
    }

    #[tokio::test]
    async fn test_replay_oracle_completes_after_last_step() {
        let plan = TaskPlan::parse(PLAN_JSON, "g").unwrap();
        let oracle = PlanReplayOracle::new(plan);
        let request = DecisionRequest {
            task: "g",
            history: &[],
            current_url: None,
            latest_observation: None,
        };
        match oracle.decide_next_action(request).await.unwrap() {
            Decision::Act(draft) => assert_eq!(draft.action_type, "navigate"),
            other => panic!("unexpected decision: {other:?}"),
        }
    }
}
