use crate::error::ErrorEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Run status only moves forward: pending -> running -> terminal, or
    /// straight from pending to cancelled/failed.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Cancelled) | (RunStatus::Pending, RunStatus::Failed) => {
                true
            }
            (RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Pending => "pending",
            TrialStatus::Running => "running",
            TrialStatus::Paused => "paused",
            TrialStatus::Completed => "completed",
            TrialStatus::Failed => "failed",
            TrialStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrialStatus::Completed | TrialStatus::Failed | TrialStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TrialStatus) -> bool {
        match (self, next) {
            (TrialStatus::Pending, TrialStatus::Running)
            | (TrialStatus::Pending, TrialStatus::Cancelled)
            | (TrialStatus::Pending, TrialStatus::Failed) => true,
            (TrialStatus::Running, TrialStatus::Paused) => true,
            (TrialStatus::Paused, TrialStatus::Running) => true,
            (TrialStatus::Running, next) | (TrialStatus::Paused, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a trial came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialOrigin {
    Matrix,
    Fork {
        parent_trial_id: String,
        label: String,
        sequence_number: u64,
    },
    Replay {
        parent_trial_id: String,
        replay_id: String,
    },
}

/// Pointer to a committed checkpoint, kept on the trial record in append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub sequence_number: u64,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Parsed harness result artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    #[serde(default = "trial_output_schema_version")]
    pub schema_version: String,
    pub outcome: String,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub output: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn trial_output_schema_version() -> String {
    "trial_output_v1".to_string()
}

impl TrialResult {
    pub fn is_error(&self) -> bool {
        self.outcome == "error"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: String,
    pub run_id: String,
    pub variant_id: String,
    pub task_id: String,
    pub repl_idx: usize,
    pub schedule_index: usize,
    pub status: TrialStatus,
    pub bindings: Value,
    pub initial_bindings: Value,
    #[serde(default)]
    pub task: Value,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRef>,
    #[serde(default)]
    pub result: Option<TrialResult>,
    #[serde(default)]
    pub failure: Option<ErrorEnvelope>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub origin: TrialOrigin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    pub fn checkpoint_labels(&self) -> Vec<String> {
        self.checkpoints.iter().map(|c| c.label.clone()).collect()
    }

    pub fn latest_checkpoint(&self) -> Option<&CheckpointRef> {
        self.checkpoints.last()
    }

    /// True when the trial was seeded from another trial's checkpoint, in
    /// which case its first checkpoint is the seed rather than harness output.
    pub fn is_seeded(&self) -> bool {
        matches!(self.origin, TrialOrigin::Fork { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunCounters {
    pub fn tally(statuses: impl IntoIterator<Item = TrialStatus>) -> Self {
        let mut counters = RunCounters::default();
        for status in statuses {
            counters.total += 1;
            match status {
                TrialStatus::Pending => counters.pending += 1,
                TrialStatus::Running => counters.running += 1,
                TrialStatus::Paused => counters.paused += 1,
                TrialStatus::Completed => counters.completed += 1,
                TrialStatus::Failed => counters.failed += 1,
                TrialStatus::Cancelled => counters.cancelled += 1,
            }
        }
        counters
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn all_terminal(&self) -> bool {
        self.terminal() == self.total
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_digest: String,
    pub trial_ids: Vec<String>,
    pub counters: RunCounters,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub peak_running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_run_status_never_transitions() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            for next in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn paused_trial_can_resume_or_end() {
        assert!(TrialStatus::Paused.can_transition_to(TrialStatus::Running));
        assert!(TrialStatus::Paused.can_transition_to(TrialStatus::Cancelled));
        assert!(!TrialStatus::Pending.can_transition_to(TrialStatus::Paused));
        assert!(!TrialStatus::Completed.can_transition_to(TrialStatus::Running));
    }

    #[test]
    fn trial_result_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "outcome": "success",
            "metrics": {"score": 1},
            "trace_id": "abc"
        });
        let result: TrialResult = serde_json::from_value(raw).expect("parse");
        assert_eq!(result.schema_version, "trial_output_v1");
        assert_eq!(result.extra.get("trace_id"), Some(&Value::from("abc")));
        let back = serde_json::to_value(&result).expect("serialize");
        assert_eq!(back["trace_id"], "abc");
    }

    #[test]
    fn counters_tally_statuses() {
        let counters = RunCounters::tally([
            TrialStatus::Completed,
            TrialStatus::Failed,
            TrialStatus::Running,
        ]);
        assert_eq!(counters.total, 3);
        assert_eq!(counters.terminal(), 2);
        assert!(!counters.all_terminal());
    }
}
