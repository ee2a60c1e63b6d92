//! Error taxonomy shared by the orchestrator and its collaborators.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A decision that could not be turned into a valid [`crate::Action`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `action_type` is not one of the recognized variants.
    #[error("malformed action: unknown action_type '{0}'")]
    UnknownActionType(String),

    /// A required field is missing or empty for this action type.
    #[error("malformed action: '{action_type}' requires a non-empty {field}")]
    MissingField {
        action_type: String,
        field: &'static str,
    },

    /// The oracle reply could not be decoded at all.
    #[error("malformed action: {0}")]
    Undecodable(String),
}

/// Failure to obtain a decision from the oracle.
#[derive(Debug, Error)]
pub enum DecisionError {
    /// Upstream unavailable or returned an error status.
    #[error("decision oracle unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded the per-call timeout.
    #[error("decision oracle timed out after {0:?}")]
    Timeout(Duration),

    /// The oracle answered, but the answer is not a valid action.
    #[error(transparent)]
    Rejected(#[from] ValidationError),
}

impl DecisionError {
    /// Transient errors are retried; a rejected answer is a planning failure.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DecisionError::Rejected(_))
    }
}

/// Failure while performing one action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("execution timed out: {0}")]
    Timeout(String),

    #[error("execution engine crashed: {0}")]
    Crash(String),
}

impl ExecutionError {
    /// Short classification label recorded with the step.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::ElementNotFound(_) => "element-not-found",
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::Crash(_) => "crash",
        }
    }
}

/// The session manager could not produce a usable handle.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("browser connection unreachable: {0}")]
    Unreachable(String),

    #[error("failed to wire session handle: {0}")]
    Wiring(String),

    #[error("acquiring session handle timed out after {0:?}")]
    Timeout(Duration),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure persisting run artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a run ended in the failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Two consecutive planning failures.
    Planning,
    /// Oracle unavailable beyond the retry bound.
    Decision,
    /// Too many consecutive execution errors.
    Execution,
    /// No session handle beyond the retry bound.
    Connection,
    /// External stop request honored between steps.
    Cancelled,
}
