use crate::checkpoint::Checkpoint;
use crate::controller::RunContext;
use crate::error::{ControlError, ControlResult};
use crate::executor::{ResumeSeed, TrialJob};
use crate::knobs::{merge_bindings, Violation};
use crate::ledger::TrialSink;
use crate::model::{CheckpointRef, Trial, TrialOrigin, TrialResult, TrialStatus};
use chrono::Utc;
use lab_core::atomic_write_json_pretty;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::info;

pub const FORK_MANIFEST_SCHEMA: &str = "fork_manifest_v1";

/// Which checkpoint of the source trial to fork from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkSelector {
    Checkpoint(String),
    /// Latest checkpoint whose recorded step is at most this value.
    Step(u64),
    Seq(u64),
}

impl ForkSelector {
    pub fn parse(selector: &str) -> ControlResult<Self> {
        let (kind, value) = selector.split_once(':').ok_or_else(|| {
            ControlError::BadConfig(format!(
                "invalid selector '{}': expected kind:value",
                selector
            ))
        })?;
        let integer = |what: &str| {
            value.parse::<u64>().map_err(|_| {
                ControlError::BadConfig(format!(
                    "invalid selector '{}': {} must be integer",
                    selector, what
                ))
            })
        };
        match kind {
            "checkpoint" => {
                if value.trim().is_empty() {
                    return Err(ControlError::BadConfig(format!(
                        "invalid selector '{}': checkpoint name empty",
                        selector
                    )));
                }
                Ok(ForkSelector::Checkpoint(value.to_string()))
            }
            "step" => Ok(ForkSelector::Step(integer("step")?)),
            "seq" => Ok(ForkSelector::Seq(integer("seq")?)),
            _ => Err(ControlError::BadConfig(format!(
                "invalid selector kind '{}': expected checkpoint|step|seq",
                kind
            ))),
        }
    }
}

impl fmt::Display for ForkSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkSelector::Checkpoint(label) => write!(f, "checkpoint:{}", label),
            ForkSelector::Step(step) => write!(f, "step:{}", step),
            ForkSelector::Seq(seq) => write!(f, "seq:{}", seq),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForkRequest {
    pub from_trial: String,
    pub at: ForkSelector,
    pub overrides: BTreeMap<String, Value>,
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForkOutcome {
    pub fork_id: String,
    pub trial_id: String,
    pub parent_trial_id: String,
    pub selector: String,
    pub source_checkpoint: CheckpointRef,
    pub strict: bool,
    pub warnings: Vec<Violation>,
    pub bindings: Value,
    pub status: TrialStatus,
    pub result: Option<TrialResult>,
    pub manifest_path: PathBuf,
}

pub struct ForkEngine<'a> {
    ctx: &'a RunContext,
}

impl<'a> ForkEngine<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    pub fn resolve_checkpoint(&self, trial_id: &str, selector: &ForkSelector) -> ControlResult<Checkpoint> {
        let store = &self.ctx.store;
        match selector {
            ForkSelector::Checkpoint(label) => store.get(trial_id, label),
            ForkSelector::Seq(seq) => store.sequence(trial_id, *seq),
            ForkSelector::Step(step) => {
                let mut best: Option<(u64, Checkpoint)> = None;
                for checkpoint in store.list(trial_id)? {
                    let Some(cp_step) = checkpoint.decode_state()?.step else {
                        continue;
                    };
                    if cp_step <= *step && best.as_ref().map_or(true, |(s, _)| cp_step >= *s) {
                        best = Some((cp_step, checkpoint));
                    }
                }
                best.map(|(_, cp)| cp)
                    .ok_or_else(|| ControlError::CheckpointNotFound {
                        trial_id: trial_id.to_string(),
                        selector: selector.to_string(),
                    })
            }
        }
    }

    /// Creates a trial seeded from the selected checkpoint, with `overrides`
    /// merged into its bindings, and runs it to a terminal status. Nothing is
    /// created when validation fails under `strict`.
    pub fn fork(&self, request: &ForkRequest) -> ControlResult<ForkOutcome> {
        let ctx = self.ctx;
        let source = ctx.ledger.trial(&request.from_trial)?;
        let source_gate = ctx.coordinator.gate(&source.trial_id).ok();
        let operation = match &source_gate {
            Some(gate) => Some(gate.operation()?),
            None => None,
        };

        let checkpoint = self.resolve_checkpoint(&source.trial_id, &request.at)?;
        let warnings = ctx.knobs.validate_bindings(&request.overrides, request.strict)?;
        let mut state = checkpoint.decode_state()?;
        if state.bindings.is_null() {
            state.bindings = source.bindings.clone();
        }
        let blob = if request.overrides.is_empty() {
            checkpoint.state.clone()
        } else {
            state.bindings = merge_bindings(&state.bindings, &request.overrides)?;
            state.to_bytes()?
        };
        let bindings = state.bindings.clone();

        let fork_id = format!("fork_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
        let now = Utc::now();
        let trial = ctx.ledger.add_trial(|trial_id, schedule_index| Trial {
            trial_id,
            run_id: source.run_id.clone(),
            variant_id: source.variant_id.clone(),
            task_id: source.task_id.clone(),
            repl_idx: source.repl_idx,
            schedule_index,
            status: TrialStatus::Pending,
            bindings: bindings.clone(),
            initial_bindings: bindings.clone(),
            task: source.task.clone(),
            checkpoints: Vec::new(),
            result: None,
            failure: None,
            exit_code: None,
            origin: TrialOrigin::Fork {
                parent_trial_id: source.trial_id.clone(),
                label: checkpoint.label.clone(),
                sequence_number: checkpoint.sequence_number,
            },
            created_at: now,
            updated_at: now,
        })?;
        let seed = ctx.store.append(&trial.trial_id, &checkpoint.label, blob)?;
        ctx.ledger.checkpoint_committed(&trial.trial_id, &seed.reference())?;
        let gate = ctx.coordinator.register(&trial.trial_id)?;
        drop(operation);

        let manifest_path = ctx.run_dir.join("forks").join(&fork_id).join("manifest.json");
        let mut manifest = json!({
            "schema_version": FORK_MANIFEST_SCHEMA,
            "operation": "fork",
            "fork_id": fork_id,
            "parent_trial_id": source.trial_id,
            "trial_id": trial.trial_id,
            "selector": request.at.to_string(),
            "source_checkpoint": checkpoint.reference(),
            "strict": request.strict,
            "overrides": request.overrides,
            "warnings": warnings,
            "created_at": now.to_rfc3339(),
            "status": TrialStatus::Pending,
        });
        atomic_write_json_pretty(&manifest_path, &manifest)?;
        info!(
            fork_id = %fork_id,
            parent_trial_id = %source.trial_id,
            trial_id = %trial.trial_id,
            label = %checkpoint.label,
            sequence_number = checkpoint.sequence_number,
            warnings = warnings.len(),
            "fork created"
        );

        let trial_id = trial.trial_id.clone();
        let outcome = {
            let _slot = ctx.slots.acquire()?;
            ctx.executor.run(TrialJob {
                trial_dir: ctx.ledger.trial_dir(&trial_id),
                trial,
                gate,
                store: &ctx.store,
                sink: &*ctx.ledger,
                resume: Some(ResumeSeed {
                    source_trial_id: source.trial_id.clone(),
                    label: checkpoint.label.clone(),
                    sequence_number: checkpoint.sequence_number,
                    state,
                }),
            })?
        };
        let (status, result) = match outcome {
            Some(outcome) => (outcome.status, outcome.result),
            None => (ctx.ledger.trial(&trial_id)?.status, None),
        };
        manifest["status"] = json!(status);
        atomic_write_json_pretty(&manifest_path, &manifest)?;

        Ok(ForkOutcome {
            fork_id,
            trial_id,
            parent_trial_id: source.trial_id,
            selector: request.at.to_string(),
            source_checkpoint: checkpoint.reference(),
            strict: request.strict,
            warnings,
            bindings,
            status,
            result,
            manifest_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fork_selector_accepts_supported_kinds() {
        assert_eq!(
            ForkSelector::parse("checkpoint:ckpt_a").expect("checkpoint selector"),
            ForkSelector::Checkpoint("ckpt_a".to_string())
        );
        assert_eq!(
            ForkSelector::parse("step:12").expect("step selector"),
            ForkSelector::Step(12)
        );
        assert_eq!(
            ForkSelector::parse("seq:34").expect("seq selector"),
            ForkSelector::Seq(34)
        );
        assert!(ForkSelector::parse("bad").is_err());
        assert!(ForkSelector::parse("unknown:1").is_err());
        assert!(ForkSelector::parse("checkpoint: ").is_err());
        assert!(ForkSelector::parse("step:x").is_err());
    }

    #[test]
    fn selector_display_round_trips() {
        for raw in ["checkpoint:before_tool_call", "step:3", "seq:1"] {
            assert_eq!(ForkSelector::parse(raw).expect("parse").to_string(), raw);
        }
    }
}
