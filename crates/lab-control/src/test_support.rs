use crate::knobs::{KnobEngine, KnobManifest};
use crate::ledger::RunLedger;
use crate::model::{Run, RunCounters, RunStatus, Trial, TrialOrigin, TrialStatus};
use chrono::Utc;
use lab_core::ensure_dir;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub struct TempDirGuard {
    pub path: PathBuf,
}

impl TempDirGuard {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&path).expect("temp dir");
        Self { path }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub fn sample_trial(trial_id: &str, schedule_index: usize) -> Trial {
    let now = Utc::now();
    Trial {
        trial_id: trial_id.to_string(),
        run_id: "run_test".to_string(),
        variant_id: "base".to_string(),
        task_id: format!("task_{}", schedule_index),
        repl_idx: 0,
        schedule_index,
        status: TrialStatus::Pending,
        bindings: json!({}),
        initial_bindings: json!({}),
        task: json!({"id": format!("task_{}", schedule_index)}),
        checkpoints: Vec::new(),
        result: None,
        failure: None,
        exit_code: None,
        origin: TrialOrigin::Matrix,
        created_at: now,
        updated_at: now,
    }
}

/// A pending run with `trials` matrix trials named trial_001, trial_002, ...
pub fn sample_ledger(run_dir: &Path, trials: usize) -> RunLedger {
    let now = Utc::now();
    let run = Run {
        run_id: "run_test".to_string(),
        status: RunStatus::Pending,
        created_at: now,
        updated_at: now,
        resolved_digest: "sha256:00".to_string(),
        trial_ids: Vec::new(),
        counters: RunCounters::default(),
        cancel_requested: false,
        peak_running: 0,
    };
    let trials = (0..trials)
        .map(|i| sample_trial(&format!("trial_{:03}", i + 1), i))
        .collect();
    RunLedger::create(run_dir, run, trials).expect("ledger")
}

/// Writes a `sh` harness script and returns its path.
pub fn write_harness(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write harness");
    path
}

/// Emits setup, before_tool_call and after_tool_call checkpoints, idling a
/// second before before_tool_call so callers can arm a pause there. A trial
/// resumed at before_tool_call only runs the last step.
pub const CHECKPOINTED_HARNESS: &str = r#"emit() {
  echo "{\"event_type\":\"checkpoint\",\"label\":\"$1\",\"step\":$2,\"state\":{\"step\":$2}}"
  read reply
}
start=0
if [ "$AGENTLAB_RESUME_LABEL" = "before_tool_call" ]; then start=2; fi
[ $start -lt 1 ] && emit setup 1
[ $start -lt 2 ] && { sleep 1; emit before_tool_call 2; }
emit after_tool_call 3
echo "{\"outcome\":\"success\",\"metrics\":{\"steps\":3},\"output\":\"$AGENTLAB_TASK_ID\"}""#;

/// Knobs `model` (string) and `temperature` (number in [0, 2]).
pub fn sample_knobs() -> KnobEngine {
    let manifest = KnobManifest::from_value(json!({
        "schema_version": "knob_manifest_v1",
        "knobs": [
            {"id": "model", "json_pointer": "/baseline/bindings/model", "type": "string"},
            {
                "id": "temperature",
                "json_pointer": "/baseline/bindings/temperature",
                "type": "number",
                "minimum": 0,
                "maximum": 2
            }
        ]
    }))
    .expect("manifest");
    KnobEngine::new(manifest).expect("engine")
}

/// A one-variant experiment over `tasks` inline tasks run by a `sh` harness.
pub fn sample_experiment(dir: &Path, harness: &str, tasks: usize, concurrency: usize) -> Value {
    let script = write_harness(dir, "harness.sh", harness);
    let tasks: Vec<Value> = (1..=tasks).map(|i| json!({"id": format!("t{}", i)})).collect();
    json!({
        "experiment": {"id": "exp_control"},
        "design": {"replications": 1, "max_concurrency": concurrency},
        "dataset": {"tasks": tasks},
        "baseline": {"variant_id": "base", "bindings": {"model": "m1", "temperature": 0.2}},
        "runtime": {
            "harness": {"command": ["sh", script.to_string_lossy()]},
            "control": {"cancel_grace_ms": 2000}
        }
    })
}
