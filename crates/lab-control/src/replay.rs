use crate::checkpoint::CheckpointStore;
use crate::controller::RunContext;
use crate::error::{ControlError, ControlResult, FieldDiff};
use crate::executor::{ResumeSeed, TrialJob, TrialOutcome};
use crate::ledger::{write_trial_record, TrialSink};
use crate::model::{CheckpointRef, RunStatus, Trial, TrialOrigin, TrialResult, TrialStatus};
use crate::pause::TrialGate;
use chrono::Utc;
use lab_core::atomic_write_json_pretty;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const REPLAY_MANIFEST_SCHEMA: &str = "replay_manifest_v1";

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub replay_id: String,
    pub trial_id: String,
    pub replay_trial_id: String,
    pub strict: bool,
    pub matched: bool,
    pub diffs: Vec<FieldDiff>,
    pub status: TrialStatus,
    pub result: Option<TrialResult>,
    pub replay_dir: PathBuf,
}

/// Records a replay execution under `replays/<replay_id>/` without touching
/// the source run.
struct ReplaySink {
    dir: PathBuf,
    trial: Mutex<Trial>,
}

impl ReplaySink {
    fn record_path(&self, trial_id: &str) -> PathBuf {
        self.dir.join("trials").join(trial_id).join("trial_state.json")
    }

    fn update(&self, trial_id: &str, apply: impl FnOnce(&mut Trial) -> ControlResult<()>) -> ControlResult<()> {
        let mut trial = self
            .trial
            .lock()
            .map_err(|_| ControlError::Storage("replay record poisoned".to_string()))?;
        if trial.trial_id != trial_id {
            return Err(ControlError::TrialNotFound(trial_id.to_string()));
        }
        apply(&mut *trial)?;
        trial.updated_at = Utc::now();
        write_trial_record(&self.record_path(trial_id), &trial)
    }

    fn transition(trial: &mut Trial, next: TrialStatus) -> ControlResult<()> {
        if !trial.status.can_transition_to(next) {
            return Err(ControlError::InvalidTransition {
                trial_id: trial.trial_id.clone(),
                from: trial.status.to_string(),
                to: next.to_string(),
            });
        }
        trial.status = next;
        Ok(())
    }
}

impl TrialSink for ReplaySink {
    fn trial_started(&self, trial_id: &str) -> ControlResult<bool> {
        self.update(trial_id, |t| Self::transition(t, TrialStatus::Running))?;
        Ok(true)
    }

    fn status_changed(&self, trial_id: &str, status: TrialStatus) -> ControlResult<()> {
        self.update(trial_id, |t| Self::transition(t, status))
    }

    fn checkpoint_committed(&self, trial_id: &str, checkpoint: &CheckpointRef) -> ControlResult<()> {
        self.update(trial_id, |t| {
            t.checkpoints.push(checkpoint.clone());
            Ok(())
        })
    }

    fn trial_finished(&self, outcome: &TrialOutcome) -> ControlResult<Option<RunStatus>> {
        self.update(&outcome.trial_id, |t| {
            Self::transition(t, outcome.status)?;
            t.result = outcome.result.clone();
            t.failure = outcome.failure.clone();
            t.exit_code = outcome.exit_code;
            Ok(())
        })?;
        Ok(None)
    }
}

/// Field-level differences between a stored trial and its replay. Checkpoint
/// labels exclude the seed a forked trial starts from.
pub fn compare_outcomes(source: &Trial, replay: &TrialOutcome) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    let expected = source.result.as_ref();
    let found = replay.result.as_ref();
    let pick = |r: Option<&TrialResult>, field: &str| -> Value {
        match (r, field) {
            (None, _) => Value::Null,
            (Some(r), "outcome") => json!(r.outcome),
            (Some(r), "metrics") => Value::Object(r.metrics.clone()),
            (Some(r), _) => r.output.clone(),
        }
    };
    for field in ["outcome", "metrics", "output"] {
        let (e, f) = (pick(expected, field), pick(found, field));
        if e != f {
            diffs.push(FieldDiff {
                field: field.to_string(),
                expected: e,
                found: f,
            });
        }
    }

    let skip = usize::from(source.is_seeded());
    let expected_labels: Vec<String> = source.checkpoint_labels().into_iter().skip(skip).collect();
    if expected_labels != replay.checkpoint_labels {
        diffs.push(FieldDiff {
            field: "checkpoint_labels".to_string(),
            expected: json!(expected_labels),
            found: json!(replay.checkpoint_labels),
        });
    }
    diffs
}

pub struct ReplayEngine<'a> {
    ctx: &'a RunContext,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Re-executes a finished trial from its initial bindings (and seed
    /// checkpoint, for forked trials) and compares the result.
    pub fn replay(&self, trial_id: &str, strict: bool) -> ControlResult<ReplayReport> {
        let ctx = self.ctx;
        let source = ctx.ledger.trial(trial_id)?;
        if !source.status.is_terminal() {
            return Err(ControlError::NotReplayable {
                trial_id: trial_id.to_string(),
                reason: format!("trial is {}", source.status),
            });
        }
        if source.result.is_none() {
            return Err(ControlError::NotReplayable {
                trial_id: trial_id.to_string(),
                reason: "trial has no stored result".to_string(),
            });
        }

        let replay_id = format!("replay_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
        let replay_dir = ctx.run_dir.join("replays").join(&replay_id);
        let replay_trial_id = format!("{}_{}", trial_id, replay_id);
        let store = CheckpointStore::open(&replay_dir.join("checkpoints"))?;

        let resume = if source.is_seeded() {
            let seed = ctx.store.sequence(trial_id, 1)?;
            store.append(&replay_trial_id, &seed.label, seed.state.clone())?;
            Some(ResumeSeed {
                source_trial_id: trial_id.to_string(),
                label: seed.label.clone(),
                sequence_number: seed.sequence_number,
                state: seed.decode_state()?,
            })
        } else {
            None
        };

        let now = Utc::now();
        let mut trial = source.clone();
        trial.trial_id = replay_trial_id.clone();
        trial.status = TrialStatus::Pending;
        trial.bindings = source.initial_bindings.clone();
        trial.checkpoints = Vec::new();
        trial.result = None;
        trial.failure = None;
        trial.exit_code = None;
        trial.origin = TrialOrigin::Replay {
            parent_trial_id: trial_id.to_string(),
            replay_id: replay_id.clone(),
        };
        trial.created_at = now;
        trial.updated_at = now;

        let sink = ReplaySink {
            dir: replay_dir.clone(),
            trial: Mutex::new(trial.clone()),
        };
        if let Some(seed) = store.latest(&replay_trial_id)? {
            sink.checkpoint_committed(&replay_trial_id, &seed.reference())?;
        } else {
            write_trial_record(&sink.record_path(&replay_trial_id), &trial)?;
        }

        let mut manifest = json!({
            "schema_version": REPLAY_MANIFEST_SCHEMA,
            "operation": "replay",
            "replay_id": replay_id,
            "parent_trial_id": trial_id,
            "replay_trial_id": replay_trial_id,
            "strict": strict,
            "created_at": now.to_rfc3339(),
        });
        let manifest_path = replay_dir.join("manifest.json");
        atomic_write_json_pretty(&manifest_path, &manifest)?;
        info!(replay_id = %replay_id, trial_id, strict, "replay started");

        let outcome = {
            let _slot = ctx.slots.acquire()?;
            ctx.executor.run(TrialJob {
                trial_dir: replay_dir.join("trials").join(&replay_trial_id),
                trial,
                gate: Arc::new(TrialGate::new(&replay_trial_id)),
                store: &store,
                sink: &sink,
                resume,
            })?
        };
        let outcome = outcome.ok_or_else(|| {
            ControlError::Storage(format!("replay {} did not start", replay_id))
        })?;

        let diffs = compare_outcomes(&source, &outcome);
        manifest["status"] = json!(outcome.status);
        manifest["matched"] = json!(diffs.is_empty());
        manifest["diffs"] = json!(diffs);
        atomic_write_json_pretty(&manifest_path, &manifest)?;

        if !diffs.is_empty() {
            warn!(replay_id = %replay_id, trial_id, diffs = diffs.len(), "replay diverged");
            if strict {
                return Err(ControlError::ReplayMismatch {
                    trial_id: trial_id.to_string(),
                    replay_id,
                    diffs,
                });
            }
        } else {
            info!(replay_id = %replay_id, trial_id, "replay matched");
        }
        Ok(ReplayReport {
            replay_id,
            trial_id: trial_id.to_string(),
            replay_trial_id,
            strict,
            matched: diffs.is_empty(),
            diffs,
            status: outcome.status,
            result: outcome.result,
            replay_dir,
        })
    }
}

/// Lists replay manifests written under a run directory, newest last.
pub fn list_replays(run_dir: &Path) -> ControlResult<Vec<Value>> {
    let root = run_dir.join("replays");
    let mut manifests = Vec::new();
    if !root.exists() {
        return Ok(manifests);
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(&root)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    dirs.sort();
    for dir in dirs {
        let path = dir.join("manifest.json");
        if path.exists() {
            manifests.push(lab_core::load_json_file(&path)?);
        }
    }
    Ok(manifests)
}
