use agentic_rpa::config::OracleConfig;
use agentic_rpa::{
    Decision, DecisionError, DecisionOracle, DecisionRequest, StepResult, TaskPlan, parse_decision,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent. You control a real Chrome browser by choosing ONE action at a time.

Reply with a single JSON object:
{"action_type": "...", "target_description": "...", "value": "...", "expected_state_change": "...", "capture_after": true|false, "reasoning": "..."}

action_type is one of:
- navigate: open the URL in "value".
- click: click the element described by "target_description" (visible text, label or placeholder).
- type: type "value" into the element described by "target_description".
- select: pick option "value" in the dropdown described by "target_description".
- wait: wait for "target_description" to appear, or "value" milliseconds.
- capture_screenshot: capture the page without changing it.
- evaluate_state: capture the page to check progress.
- complete: the task is done; put a short summary in "reasoning".

Rules:
1. Return ONLY the JSON object. No markdown, no explanation.
2. click, type and select need a target_description. type and select need a value.
3. Set capture_after to true when the result of the action matters for your next decision.
4. If a step failed, read its error and try a different approach.
5. Use complete as soon as the task is accomplished."#;

const PLAN_PROMPT: &str = r#"You plan browser automation tasks. Break the task into atomic browser actions.

Reply with a single JSON object:
{"goal": "...",
 "steps": [{"action_type": "...", "target_description": "...", "value": "...", "expected_state_change": "...", "capture_after": true|false, "reasoning": "...", "wait_conditions": ["..."]}],
 "assumptions": ["..."], "potential_issues": ["..."], "success_criteria": ["..."],
 "estimated_complexity": "simple" | "moderate" | "complex"}

Allowed action_type values: navigate, click, type, select, wait, capture_screenshot, evaluate_state.
click, type and select need a target_description; type and select need a value; navigate needs a URL in value.
Return ONLY the JSON object."#;

/// Decision oracle backed by an OpenAI-compatible chat completions endpoint.
///
/// Stateless: every request is rebuilt from the task, a window of the run
/// history and the latest capture.
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    config: OracleConfig,
}

impl OpenAiOracle {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        Ok(Self {
            client: Client::new(),
            api_key,
            config,
        })
    }

    /// Ask for a whole plan up front.
    pub async fn plan(&self, task: &str) -> Result<TaskPlan> {
        let messages = vec![
            json!({"role": "system", "content": PLAN_PROMPT}),
            json!({"role": "user", "content": format!("Task: {task}")}),
        ];
        let content = self.chat(messages).await?;
        debug!(reply = %content, "Plan reply");
        TaskPlan::parse(&content, task).context("planner returned an unusable plan")
    }

    async fn decision_messages(&self, request: &DecisionRequest<'_>) -> Vec<Value> {
        let text = decision_prompt(request, self.config.history_window);
        let mut content = vec![json!({"type": "text", "text": text})];

        if self.config.vision {
            if let Some(observation) = request.latest_observation {
                match tokio::fs::read(&observation.handle).await {
                    Ok(png) => {
                        let url = format!("data:image/png;base64,{}", STANDARD.encode(png));
                        content.push(json!({"type": "image_url", "image_url": {"url": url}}));
                    }
                    Err(e) => {
                        let path = &observation.handle;
                        warn!(path = %path, error = %e, "Could not attach observation");
                    }
                }
            }
        }

        vec![
            json!({"role": "system", "content": SYSTEM_PROMPT}),
            json!({"role": "user", "content": content}),
        ]
    }

    async fn chat(&self, messages: Vec<Value>) -> Result<String, DecisionError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": self.config.temperature,
            }))
            .send()
            .await
            .map_err(|e| DecisionError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            DecisionError::Unavailable(format!("unreadable response ({status}): {e}"))
        })?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown API error");
            return Err(DecisionError::Unavailable(format!("API error ({status}): {message}")));
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| DecisionError::Unavailable(format!("no content in response: {body}")))
    }
}

#[async_trait]
impl DecisionOracle for OpenAiOracle {
    async fn decide_next_action(
        &self,
        request: DecisionRequest<'_>,
    ) -> Result<Decision, DecisionError> {
        let messages = self.decision_messages(&request).await;
        let content = self.chat(messages).await?;
        debug!(reply = %content, "Oracle reply");
        Ok(parse_decision(&content)?)
    }
}

/// Text part of a decision request: task, where we are, and what happened so far.
fn decision_prompt(request: &DecisionRequest<'_>, window: usize) -> String {
    let mut prompt = format!("Task: {}\n", request.task);
    prompt.push_str(&format!(
        "Current URL: {}\n",
        request.current_url.unwrap_or("unknown (nothing loaded yet)")
    ));

    if request.history.is_empty() {
        prompt.push_str("\nNo steps taken yet.\n");
    } else {
        let skip = request.history.len().saturating_sub(window);
        prompt.push_str("\nSteps so far:\n");
        if skip > 0 {
            prompt.push_str(&format!("({skip} earlier steps omitted)\n"));
        }
        for step in &request.history[skip..] {
            prompt.push_str(&history_line(step));
            prompt.push('\n');
        }
    }

    if request.latest_observation.is_some() {
        prompt.push_str("\nThe attached screenshot shows the page after the latest capture.\n");
    }
    prompt.push_str("\nWhat is your next action?");
    prompt
}

fn history_line(step: &StepResult) -> String {
    let summary = step.summary();
    let mut line = format!("{}. {}", summary.step_index, summary.action_type);
    if !summary.target_description.is_empty() {
        line.push_str(&format!(" {}", summary.target_description));
    }
    if let Some(value) = &summary.value {
        line.push_str(&format!(" = {value:?}"));
    }
    line.push_str(&format!(" -> {}", summary.status.as_str()));
    if let Some(err) = &summary.error_message {
        line.push_str(&format!(" ({err})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentic_rpa::{Action, ActionDraft, ExecutionError, History, Observation, StepOutcome};

    fn history() -> History {
        let mut history = History::new();
        let nav = ActionDraft::new("navigate").value("https://linear.app");
        history.record_outcome(Action::try_from(nav).unwrap(), StepOutcome::success());
        let click = Action::try_from(ActionDraft::new("click").target("New project")).unwrap();
        let missing = ExecutionError::ElementNotFound("New project".into());
        history.record_execution_error(click, &missing);
        history
    }

    #[test]
    fn test_prompt_lists_history_in_order() {
        let history = history();
        let request = DecisionRequest {
            task: "Create a project",
            history: history.entries(),
            current_url: Some("https://linear.app"),
            latest_observation: None,
        };
        let prompt = decision_prompt(&request, 20);

        assert!(prompt.starts_with("Task: Create a project\nCurrent URL: https://linear.app\n"));
        let first = prompt.find("1. navigate").unwrap();
        let second = prompt.find("2. click New project -> error ([element-not-found]").unwrap();
        assert!(first < second);
        assert!(!prompt.contains("screenshot"));
    }

    #[test]
    fn test_prompt_windows_long_history() {
        let history = history();
        let observation = Observation {
            handle: "step_01.png".into(),
            url: None,
        };
        let request = DecisionRequest {
            task: "t",
            history: history.entries(),
            current_url: None,
            latest_observation: Some(&observation),
        };
        let prompt = decision_prompt(&request, 1);

        assert!(prompt.contains("(1 earlier steps omitted)"));
        assert!(!prompt.contains("1. navigate"));
        assert!(prompt.contains("2. click"));
        assert!(prompt.contains("attached screenshot"));
    }

    #[test]
    fn test_empty_history_prompt() {
        let request = DecisionRequest {
            task: "t",
            history: &[],
            current_url: None,
            latest_observation: None,
        };
        let prompt = decision_prompt(&request, 20);
        assert!(prompt.contains("No steps taken yet."));
        assert!(prompt.contains("Current URL: unknown"));
    }
}
