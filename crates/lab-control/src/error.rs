use crate::knobs::Violation;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// A field that differed between a trial and its replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub expected: Value,
    pub found: Value,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("validation failed with {} violation(s): {}", .violations.len(), summarize(.violations))]
    ValidationFailed { violations: Vec<Violation> },

    #[error("no checkpoint matching {selector} for trial {trial_id}")]
    CheckpointNotFound { trial_id: String, selector: String },

    #[error("trial {trial_id} is at checkpoint {found}, not {expected}")]
    CheckpointMismatch {
        trial_id: String,
        expected: String,
        found: String,
    },

    #[error("trial {trial_id} did not reach checkpoint {label} within {timeout_ms}ms")]
    PauseTimeout {
        trial_id: String,
        label: String,
        timeout_ms: u64,
    },

    #[error("trial {trial_id} reached terminal status {status} before the pause point")]
    PauseAlreadyTerminal { trial_id: String, status: String },

    #[error("replay {replay_id} of trial {trial_id} diverged in {} field(s)", .diffs.len())]
    ReplayMismatch {
        trial_id: String,
        replay_id: String,
        diffs: Vec<FieldDiff>,
    },

    #[error("failed to spawn harness for trial {trial_id}: {message}")]
    SpawnFailed { trial_id: String, message: String },

    #[error("trial {trial_id} crashed (exit status {}): {diagnostic}", .exit_status.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    TrialCrashed {
        trial_id: String,
        exit_status: Option<i32>,
        diagnostic: String,
    },

    #[error("run {run_id} is already {status}")]
    RunAlreadyTerminal { run_id: String, status: String },

    #[error("trial not found: {0}")]
    TrialNotFound(String),

    #[error("trial {trial_id} cannot move from {from} to {to}")]
    InvalidTransition {
        trial_id: String,
        from: String,
        to: String,
    },

    #[error("trial {trial_id} cannot be replayed: {reason}")]
    NotReplayable { trial_id: String, reason: String },

    #[error("operation_in_progress: run is already under control operation")]
    OperationInProgress,

    #[error("storage error: {0}")]
    Storage(String),
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControlError {
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::BadConfig(_) => "bad_config",
            ControlError::ValidationFailed { .. } => "validation_failed",
            ControlError::CheckpointNotFound { .. } => "checkpoint_not_found",
            ControlError::CheckpointMismatch { .. } => "checkpoint_mismatch",
            ControlError::PauseTimeout { .. } => "pause_timeout",
            ControlError::PauseAlreadyTerminal { .. } => "pause_already_terminal",
            ControlError::ReplayMismatch { .. } => "replay_mismatch",
            ControlError::SpawnFailed { .. } => "spawn_failed",
            ControlError::TrialCrashed { .. } => "trial_crashed",
            ControlError::RunAlreadyTerminal { .. } => "run_already_terminal",
            ControlError::TrialNotFound(_) => "trial_not_found",
            ControlError::InvalidTransition { .. } => "invalid_transition",
            ControlError::NotReplayable { .. } => "not_replayable",
            ControlError::OperationInProgress => "operation_in_progress",
            ControlError::Storage(_) => "storage_error",
        }
    }

    pub fn details(&self) -> Value {
        match self {
            ControlError::BadConfig(_) | ControlError::Storage(_) => json!({}),
            ControlError::ValidationFailed { violations } => json!({ "violations": violations }),
            ControlError::CheckpointNotFound { trial_id, selector } => {
                json!({ "trial_id": trial_id, "selector": selector })
            }
            ControlError::CheckpointMismatch {
                trial_id,
                expected,
                found,
            } => json!({ "trial_id": trial_id, "expected": expected, "found": found }),
            ControlError::PauseTimeout {
                trial_id,
                label,
                timeout_ms,
            } => json!({ "trial_id": trial_id, "label": label, "timeout_ms": timeout_ms }),
            ControlError::PauseAlreadyTerminal { trial_id, status } => {
                json!({ "trial_id": trial_id, "status": status })
            }
            ControlError::ReplayMismatch {
                trial_id,
                replay_id,
                diffs,
            } => json!({ "trial_id": trial_id, "replay_id": replay_id, "diffs": diffs }),
            ControlError::SpawnFailed { trial_id, .. } => json!({ "trial_id": trial_id }),
            ControlError::TrialCrashed {
                trial_id,
                exit_status,
                diagnostic,
            } => json!({
                "trial_id": trial_id,
                "exit_status": exit_status,
                "stderr_tail": diagnostic,
            }),
            ControlError::RunAlreadyTerminal { run_id, status } => {
                json!({ "run_id": run_id, "status": status })
            }
            ControlError::TrialNotFound(trial_id) => json!({ "trial_id": trial_id }),
            ControlError::InvalidTransition { trial_id, from, to } => {
                json!({ "trial_id": trial_id, "from": from, "to": to })
            }
            ControlError::NotReplayable { trial_id, .. } => json!({ "trial_id": trial_id }),
            ControlError::OperationInProgress => json!({}),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Storage(format!("{:#}", err))
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Storage(format!("json: {}", err))
    }
}

/// `{code, message, details}` as recorded on failed trials and printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ErrorEnvelope {
    pub fn new(code: &str, message: impl Into<String>, details: Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details,
        }
    }
}
