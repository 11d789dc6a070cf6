//! Run lifecycle: expanding the trial matrix, bounded dispatch, cancellation,
//! and the entry points for pause, resume, fork and replay on one run.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{ExperimentPlan, TaskSpec};
use crate::error::{ControlError, ControlResult};
use crate::executor::{TrialExecutor, TrialJob};
use crate::fork::{ForkEngine, ForkOutcome, ForkRequest};
use crate::knobs::{KnobEngine, KnobManifest};
use crate::ledger::{acquire_run_operation_lock, DispatchGuard, RunLedger, RunOperationLock};
use crate::model::{Run, RunCounters, RunStatus, Trial, TrialOrigin, TrialStatus};
use crate::pause::{PauseCoordinator, PauseOutcome, ResumeOutcome};
use crate::replay::{ReplayEngine, ReplayReport};
use chrono::Utc;
use lab_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
    load_json_file,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub const RUN_MANIFEST_SCHEMA: &str = "run_manifest_v1";
pub const RUNNER_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));

const MANIFEST_FILE: &str = "manifest.json";
const RESOLVED_FILE: &str = "resolved_experiment.json";
const RESOLVED_DIGEST_FILE: &str = "resolved_experiment.digest";
const KNOB_MANIFEST_FILE: &str = "knob_manifest.json";

#[derive(Default)]
struct SlotState {
    in_use: usize,
    peak: usize,
}

/// Execution slots shared by matrix dispatch, forks and replays, so derived
/// trials count against the same concurrency bound.
pub struct SlotPool {
    limit: usize,
    state: Mutex<SlotState>,
    freed: Condvar,
}

pub struct SlotGuard<'a> {
    pool: &'a SlotPool,
}

impl SlotPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            state: Mutex::new(SlotState::default()),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> ControlResult<MutexGuard<'_, SlotState>> {
        self.state
            .lock()
            .map_err(|_| ControlError::Storage("slot pool poisoned".to_string()))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Blocks until a slot is free.
    pub fn acquire(&self) -> ControlResult<SlotGuard<'_>> {
        let mut state = self.lock()?;
        while state.in_use >= self.limit {
            state = self
                .freed
                .wait(state)
                .map_err(|_| ControlError::Storage("slot pool poisoned".to_string()))?;
        }
        state.in_use += 1;
        state.peak = state.peak.max(state.in_use);
        Ok(SlotGuard { pool: self })
    }

    pub fn in_use(&self) -> ControlResult<usize> {
        Ok(self.lock()?.in_use)
    }

    pub fn peak(&self) -> ControlResult<usize> {
        Ok(self.lock()?.peak)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut state = match self.pool.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.in_use = state.in_use.saturating_sub(1);
        self.pool.freed.notify_one();
    }
}

/// Everything the control operations of one run share.
pub struct RunContext {
    pub run_dir: PathBuf,
    pub resolved: Value,
    pub plan: ExperimentPlan,
    pub ledger: Arc<RunLedger>,
    pub store: Arc<CheckpointStore>,
    pub knobs: Arc<KnobEngine>,
    pub coordinator: PauseCoordinator,
    pub executor: TrialExecutor,
    pub slots: SlotPool,
}

impl RunContext {
    fn new(
        run_dir: &Path,
        resolved: Value,
        plan: ExperimentPlan,
        ledger: RunLedger,
        knobs: KnobEngine,
    ) -> ControlResult<Self> {
        let store = Arc::new(CheckpointStore::open(&run_dir.join("checkpoints"))?);
        let ledger = Arc::new(ledger);
        let knobs = Arc::new(knobs);
        let coordinator = PauseCoordinator::new(store.clone(), ledger.clone(), knobs.clone());
        // pending trials get their gate up front so a pause can be armed
        // before the trial is dispatched
        for trial in ledger.trials()? {
            if !trial.status.is_terminal() {
                coordinator.register(&trial.trial_id)?;
            }
        }
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            executor: TrialExecutor::from_plan(&plan),
            slots: SlotPool::new(plan.max_concurrency),
            resolved,
            plan,
            ledger,
            store,
            knobs,
            coordinator,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialSummary {
    pub trial_id: String,
    pub schedule_index: usize,
    pub variant_id: String,
    pub task_id: String,
    pub repl_idx: usize,
    pub status: TrialStatus,
    pub origin: TrialOrigin,
    pub checkpoints: usize,
    pub outcome: Option<String>,
    pub failure_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub run_dir: PathBuf,
    pub counters: RunCounters,
    pub peak_running: usize,
    pub cancel_requested: bool,
    pub trials: Vec<TrialSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Trials that were live when the cancel landed and were told to stop.
    pub signalled: Vec<String>,
}

/// Owns one run directory for as long as it lives.
pub struct RunController {
    ctx: RunContext,
    _lock: RunOperationLock,
}

impl RunController {
    /// Expands the trial matrix of `resolved` into a new run under
    /// `runs_root`, recorded as pending.
    pub fn schedule(
        runs_root: &Path,
        resolved: Value,
        knobs: KnobEngine,
        base_dir: &Path,
    ) -> ControlResult<Self> {
        let plan = ExperimentPlan::from_resolved(&resolved, base_dir)?;
        let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
        let run_dir = runs_root.join(&run_id);
        if run_dir.exists() {
            return Err(ControlError::Storage(format!(
                "run directory already exists: {}",
                run_dir.display()
            )));
        }
        ensure_dir(&run_dir)?;
        let lock = acquire_run_operation_lock(&run_dir)?;

        let digest = canonical_json_digest(&resolved);
        atomic_write_json_pretty(&run_dir.join(RESOLVED_FILE), &resolved)?;
        atomic_write_bytes(&run_dir.join(RESOLVED_DIGEST_FILE), digest.as_bytes())?;
        atomic_write_json_pretty(
            &run_dir.join(KNOB_MANIFEST_FILE),
            &serde_json::to_value(knobs.manifest())?,
        )?;
        let now = Utc::now();
        atomic_write_json_pretty(
            &run_dir.join(MANIFEST_FILE),
            &json!({
                "schema_version": RUN_MANIFEST_SCHEMA,
                "run_id": run_id,
                "experiment_id": plan.experiment_id,
                "created_at": now.to_rfc3339(),
                "runner_version": RUNNER_VERSION,
                "base_dir": plan.base_dir.display().to_string(),
                "resolved_digest": digest,
            }),
        )?;

        let trials: Vec<Trial> = plan
            .trial_matrix()
            .into_iter()
            .map(|cell| Trial {
                trial_id: cell.trial_id,
                run_id: run_id.clone(),
                variant_id: cell.variant.variant_id,
                task_id: cell.task.task_id,
                repl_idx: cell.repl_idx,
                schedule_index: cell.schedule_index,
                status: TrialStatus::Pending,
                bindings: cell.variant.bindings.clone(),
                initial_bindings: cell.variant.bindings,
                task: cell.task.task,
                checkpoints: Vec::new(),
                result: None,
                failure: None,
                exit_code: None,
                origin: TrialOrigin::Matrix,
                created_at: now,
                updated_at: now,
            })
            .collect();
        let trial_count = trials.len();
        let run = Run {
            run_id: run_id.clone(),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            resolved_digest: digest,
            trial_ids: Vec::new(),
            counters: RunCounters::default(),
            cancel_requested: false,
            peak_running: 0,
        };
        let ledger = RunLedger::create(&run_dir, run, trials)?;
        info!(
            run_id = %run_id,
            trials = trial_count,
            max_concurrency = plan.max_concurrency,
            "run scheduled"
        );
        Ok(Self {
            ctx: RunContext::new(&run_dir, resolved, plan, ledger, knobs)?,
            _lock: lock,
        })
    }

    /// Reopens an existing run. Trials a dead control process left running
    /// or paused are failed as orphaned.
    pub fn open(run_dir: &Path) -> ControlResult<Self> {
        let lock = acquire_run_operation_lock(run_dir)?;
        let manifest = load_json_file(&run_dir.join(MANIFEST_FILE))?;
        let resolved = load_json_file(&run_dir.join(RESOLVED_FILE))?;
        let recorded = fs::read_to_string(run_dir.join(RESOLVED_DIGEST_FILE))?;
        let digest = canonical_json_digest(&resolved);
        if recorded.trim() != digest {
            return Err(ControlError::Storage(format!(
                "{} does not match its recorded digest ({} != {})",
                RESOLVED_FILE,
                digest,
                recorded.trim()
            )));
        }
        let base_dir = manifest
            .get("base_dir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| ControlError::Storage(format!("{} missing base_dir", MANIFEST_FILE)))?;
        let knobs = KnobEngine::new(KnobManifest::from_value(load_json_file(
            &run_dir.join(KNOB_MANIFEST_FILE),
        )?)?)?;

        let ledger = RunLedger::load(run_dir)?;
        let run = ledger.run()?;
        if run.resolved_digest != digest {
            return Err(ControlError::Storage(format!(
                "run {} was scheduled from a different configuration",
                run.run_id
            )));
        }
        let orphans = ledger.recover_orphans()?;
        if !orphans.is_empty() {
            warn!(run_id = %run.run_id, orphans = ?orphans, "reopened run had live trials");
        }

        let mut seen = BTreeSet::new();
        let tasks: Vec<TaskSpec> = ledger
            .trials()?
            .into_iter()
            .filter(|t| seen.insert(t.task_id.clone()))
            .map(|t| TaskSpec {
                task_id: t.task_id,
                task: t.task,
            })
            .collect();
        let plan = ExperimentPlan::for_existing_run(&resolved, &base_dir, tasks)?;
        info!(run_id = %run.run_id, status = %run.status, "run opened");
        Ok(Self {
            ctx: RunContext::new(run_dir, resolved, plan, ledger, knobs)?,
            _lock: lock,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn run_dir(&self) -> &Path {
        &self.ctx.run_dir
    }

    pub fn plan(&self) -> &ExperimentPlan {
        &self.ctx.plan
    }

    pub fn run(&self) -> ControlResult<Run> {
        self.ctx.ledger.run()
    }

    pub fn trials(&self) -> ControlResult<Vec<Trial>> {
        self.ctx.ledger.trials()
    }

    pub fn trial(&self, trial_id: &str) -> ControlResult<Trial> {
        self.ctx.ledger.trial(trial_id)
    }

    pub fn checkpoints(&self, trial_id: &str) -> ControlResult<Vec<Checkpoint>> {
        self.ctx.ledger.trial(trial_id)?;
        self.ctx.store.list(trial_id)
    }

    pub fn summary(&self) -> ControlResult<RunSummary> {
        let run = self.ctx.ledger.run()?;
        let trials = self
            .ctx
            .ledger
            .trials()?
            .into_iter()
            .map(|t| TrialSummary {
                checkpoints: t.checkpoints.len(),
                outcome: t.result.as_ref().map(|r| r.outcome.clone()),
                failure_code: t.failure.as_ref().map(|f| f.code.clone()),
                trial_id: t.trial_id,
                schedule_index: t.schedule_index,
                variant_id: t.variant_id,
                task_id: t.task_id,
                repl_idx: t.repl_idx,
                status: t.status,
                origin: t.origin,
            })
            .collect();
        Ok(RunSummary {
            run_id: run.run_id,
            status: run.status,
            run_dir: self.ctx.run_dir.clone(),
            counters: run.counters,
            peak_running: run.peak_running,
            cancel_requested: run.cancel_requested,
            trials,
        })
    }

    /// Runs every pending trial, at most `max_concurrency` at a time, in
    /// schedule order, and blocks until the run is terminal.
    pub fn dispatch(&self) -> ControlResult<RunSummary> {
        let ctx = &self.ctx;
        ctx.ledger.begin_dispatch()?;
        let mut guard = DispatchGuard::new(&ctx.ledger);

        let queue: VecDeque<Trial> = ctx
            .ledger
            .trials()?
            .into_iter()
            .filter(|t| t.status == TrialStatus::Pending)
            .collect();
        let workers = ctx.slots.limit().min(queue.len());
        let run_id = ctx.ledger.run()?.run_id;
        info!(run_id = %run_id, pending = queue.len(), workers, "dispatch started");
        let queue = Mutex::new(queue);

        thread::scope(|scope| -> ControlResult<()> {
            let handles: Vec<_> = (0..workers)
                .map(|_| scope.spawn(|| self.drain(&queue)))
                .collect();
            let mut first_error = None;
            for handle in handles {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(ControlError::Storage("dispatch worker panicked".to_string()))
                });
                if let Err(err) = result {
                    warn!(run_id = %run_id, error = %err, "dispatch worker failed");
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        })?;

        // forks started while the matrix drained still count
        let status = ctx.ledger.wait_terminal(None)?;
        guard.complete();
        info!(run_id = %run_id, status = %status, "dispatch finished");
        self.summary()
    }

    fn drain(&self, queue: &Mutex<VecDeque<Trial>>) -> ControlResult<()> {
        let ctx = &self.ctx;
        loop {
            let next = queue
                .lock()
                .map_err(|_| ControlError::Storage("dispatch queue poisoned".to_string()))?
                .pop_front();
            let Some(trial) = next else {
                return Ok(());
            };
            let _slot = ctx.slots.acquire()?;
            let gate = ctx.coordinator.register(&trial.trial_id)?;
            ctx.executor.run(TrialJob {
                trial_dir: ctx.ledger.trial_dir(&trial.trial_id),
                trial,
                gate,
                store: &ctx.store,
                sink: &*ctx.ledger,
                resume: None,
            })?;
        }
    }

    /// Cancels pending trials now and asks live ones to stop. The run turns
    /// cancelled once the last live trial has drained.
    pub fn cancel(&self) -> ControlResult<CancelOutcome> {
        let signalled = self.ctx.ledger.request_cancel()?;
        self.ctx.coordinator.cancel_all()?;
        let run = self.ctx.ledger.run()?;
        Ok(CancelOutcome {
            run_id: run.run_id,
            status: run.status,
            signalled,
        })
    }

    pub fn pause(&self, trial_id: &str, label: &str, timeout: Duration) -> ControlResult<PauseOutcome> {
        self.ctx.coordinator.pause(trial_id, label, timeout)
    }

    pub fn resume(
        &self,
        trial_id: &str,
        label: &str,
        overrides: Option<&BTreeMap<String, Value>>,
    ) -> ControlResult<ResumeOutcome> {
        self.ctx.coordinator.resume(trial_id, label, overrides)
    }

    pub fn fork(&self, request: &ForkRequest) -> ControlResult<ForkOutcome> {
        ForkEngine::new(&self.ctx).fork(request)
    }

    pub fn replay(&self, trial_id: &str, strict: bool) -> ControlResult<ReplayReport> {
        ReplayEngine::new(&self.ctx).replay(trial_id, strict)
    }
}
