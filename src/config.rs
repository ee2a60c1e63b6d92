//! Configuration for the orchestrator and the concrete collaborators.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Bounds on the plan/execute loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum executed steps before a run is exhausted.
    pub max_steps: usize,
    /// Retries for a transient oracle failure.
    pub decision_retry_limit: u32,
    /// Consecutive execution errors tolerated before the run fails.
    pub execution_retry_limit: u32,
    /// Retries for acquiring a session handle.
    pub connection_retry_limit: u32,
    /// Upper bound for any single oracle, engine or session call.
    pub per_call_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            decision_retry_limit: 3,
            execution_retry_limit: 3,
            connection_retry_limit: 3,
            per_call_timeout_ms: 60_000,
            backoff_base_ms: 500,
            backoff_multiplier: 2.0,
            backoff_max_ms: 10_000,
        }
    }
}

impl OrchestratorConfig {
    /// Builder: set max steps.
    pub fn max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    /// Builder: no waiting between retries.
    pub fn without_backoff(mut self) -> Self {
        self.backoff_base_ms = 0;
        self.backoff_max_ms = 0;
        self.backoff_multiplier = 1.0;
        self
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    fn backoff(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn decision_policy(&self) -> RetryPolicy {
        self.backoff().with_max_retries(self.decision_retry_limit)
    }

    pub fn execution_policy(&self) -> RetryPolicy {
        self.backoff().with_max_retries(self.execution_retry_limit)
    }

    pub fn connection_policy(&self) -> RetryPolicy {
        self.backoff().with_max_retries(self.connection_retry_limit)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.per_call_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "per_call_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "backoff_multiplier",
                reason: format!("must be >= 1.0, got {}", self.backoff_multiplier),
            });
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid {
                field: "backoff_max_ms",
                reason: "must not be smaller than backoff_base_ms".into(),
            });
        }
        Ok(())
    }
}

/// How to reach (or start) the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Remote-debugging port of an already running Chrome.
    pub debug_port: u16,
    /// Try to attach to a running Chrome before launching one.
    pub attach_first: bool,
    pub headless: bool,
    /// Persistent profile for a launched Chrome. Defaults to `./agent_profile`.
    pub profile_dir: Option<PathBuf>,
    pub chrome_path: Option<PathBuf>,
    pub idle_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debug_port: 9222,
            attach_first: true,
            headless: false,
            profile_dir: None,
            chrome_path: None,
            idle_timeout_secs: 600,
        }
    }
}

impl BrowserConfig {
    pub fn debug_endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.debug_port)
    }
}

/// The chat-completions decision oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub model: String,
    pub endpoint: String,
    pub temperature: f32,
    /// Attach the latest screenshot to each decision request.
    pub vision: bool,
    /// How many past steps are sent with each request.
    pub history_window: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            temperature: 0.2,
            vision: true,
            history_window: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub screenshot_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub plans_dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            screenshot_dir: PathBuf::from("screenshots"),
            runs_dir: PathBuf::from("runs"),
            plans_dir: PathBuf::from("plans"),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub orchestrator: OrchestratorConfig,
    pub browser: BrowserConfig,
    pub oracle: OracleConfig,
    pub artifacts: ArtifactsConfig,
}

impl AgentConfig {
    /// Load from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.orchestrator.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}
