use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The closed set of things the agent can do in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Navigate,
    Click,
    Type,
    Select,
    Wait,
    CaptureScreenshot,
    EvaluateState,
    Complete,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::Navigate,
        ActionType::Click,
        ActionType::Type,
        ActionType::Select,
        ActionType::Wait,
        ActionType::CaptureScreenshot,
        ActionType::EvaluateState,
        ActionType::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Navigate => "navigate",
            ActionType::Click => "click",
            ActionType::Type => "type",
            ActionType::Select => "select",
            ActionType::Wait => "wait",
            ActionType::CaptureScreenshot => "capture_screenshot",
            ActionType::EvaluateState => "evaluate_state",
            ActionType::Complete => "complete",
        }
    }

    fn requires_target(&self) -> bool {
        matches!(self, ActionType::Click | ActionType::Type | ActionType::Select)
    }

    fn requires_value(&self) -> bool {
        matches!(self, ActionType::Type | ActionType::Select)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ActionType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownActionType(s.to_string()))
    }
}

/// The untyped wire shape of an action, as an oracle proposes it.
///
/// Nothing in a draft is trusted. It becomes an [`Action`] only through
/// [`Action::try_from`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDraft {
    pub action_type: String,
    #[serde(default)]
    pub target_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub expected_state_change: String,
    #[serde(default)]
    pub capture_after: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_conditions: Vec<String>,
}

impl ActionDraft {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            ..Default::default()
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target_description = target.into();
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn capture_after(mut self, capture: bool) -> Self {
        self.capture_after = capture;
        self
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }
}

/// One validated atomic step of automation.
///
/// Fields are private: the only way in is through validation, including
/// deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ActionDraft", into = "ActionDraft")]
pub struct Action {
    action_type: ActionType,
    target_description: String,
    value: Option<String>,
    expected_state_change: String,
    capture_after: bool,
    reasoning: String,
    wait_conditions: Vec<String>,
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn target_description(&self) -> &str {
        &self.target_description
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn expected_state_change(&self) -> &str {
        &self.expected_state_change
    }

    pub fn capture_after(&self) -> bool {
        self.capture_after
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn wait_conditions(&self) -> &[String] {
        &self.wait_conditions
    }

    /// Whether an observation must follow this action.
    pub fn wants_observation(&self) -> bool {
        self.capture_after
            || matches!(
                self.action_type,
                ActionType::CaptureScreenshot | ActionType::EvaluateState
            )
    }

    /// One-line human description, used in logs and run summaries.
    pub fn describe(&self) -> String {
        match (self.action_type, self.value.as_deref()) {
            (ActionType::Navigate, Some(url)) => format!("navigate to {url}"),
            (ActionType::Type, Some(text)) => {
                format!("type '{text}' into {}", self.target_description)
            }
            (ActionType::Select, Some(option)) => {
                format!("select '{option}' from {}", self.target_description)
            }
            (t, _) if self.target_description.is_empty() => t.to_string(),
            (t, _) => format!("{t} {}", self.target_description),
        }
    }
}

impl TryFrom<ActionDraft> for Action {
    type Error = ValidationError;

    fn try_from(draft: ActionDraft) -> Result<Self, Self::Error> {
        let action_type: ActionType = draft.action_type.parse()?;
        let target_description = draft.target_description.trim().to_string();
        let mut value = draft
            .value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if action_type.requires_target() && target_description.is_empty() {
            return Err(ValidationError::MissingField {
                action_type: action_type.to_string(),
                field: "target_description",
            });
        }
        if action_type.requires_value() && value.is_none() {
            return Err(ValidationError::MissingField {
                action_type: action_type.to_string(),
                field: "value",
            });
        }
        if action_type == ActionType::Navigate && value.is_none() {
            value = extract_url(&target_description);
            if value.is_none() {
                return Err(ValidationError::MissingField {
                    action_type: action_type.to_string(),
                    field: "value (URL)",
                });
            }
        }

        Ok(Action {
            action_type,
            target_description,
            value,
            expected_state_change: draft.expected_state_change,
            capture_after: draft.capture_after,
            reasoning: draft.reasoning,
            wait_conditions: draft.wait_conditions,
        })
    }
}

impl From<Action> for ActionDraft {
    fn from(action: Action) -> Self {
        ActionDraft {
            action_type: action.action_type.to_string(),
            target_description: action.target_description,
            value: action.value,
            expected_state_change: action.expected_state_change,
            capture_after: action.capture_after,
            reasoning: action.reasoning,
            wait_conditions: action.wait_conditions,
        }
    }
}

/// First http(s) URL mentioned in free text.
fn extract_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|word| word.starts_with("http://") || word.starts_with("https://"))
        .map(|word| {
            word.trim_end_matches(|c: char| matches!(c, '.' | ',' | ')' | '"' | '\''))
                .to_string()
        })
}

/// What an oracle hands back for one planning request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Perform this (not yet validated) action next.
    Act(ActionDraft),
    /// The task is done.
    Complete { summary: Option<String> },
}

/// Decode a raw oracle reply into a [`Decision`].
///
/// Accepts an optional markdown code fence around a single JSON object. An
/// `action_type` of `complete` is the completion marker. Anything that is not
/// a JSON object with a string `action_type` fails closed.
pub fn parse_decision(raw: &str) -> Result<Decision, ValidationError> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|e| ValidationError::Undecodable(format!("invalid JSON: {e}")))?;

    let kind = value
        .get("action_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ValidationError::Undecodable("missing string field 'action_type'".into()))?;

    if kind.trim().eq_ignore_ascii_case(ActionType::Complete.as_str()) {
        let summary = ["summary", "reasoning"]
            .iter()
            .filter_map(|key| value.get(*key).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(String::from);
        return Ok(Decision::Complete { summary });
    }

    let draft: ActionDraft = serde_json::from_value(value)
        .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
    Ok(Decision::Act(draft))
}
