use crate::error::{ControlError, ControlResult, ErrorEnvelope};
use crate::executor::TrialOutcome;
use crate::model::{CheckpointRef, Run, RunCounters, RunStatus, Trial, TrialStatus};
use chrono::Utc;
use lab_core::{atomic_write_json_pretty, ensure_dir, load_json_file};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const RUN_CONTROL_SCHEMA: &str = "run_control_v1";
pub const TRIAL_STATE_SCHEMA: &str = "trial_state_v1";

/// Receives every state change a running trial goes through.
pub trait TrialSink: Send + Sync {
    /// Marks the trial running. Returns false when it must not start because
    /// it is already terminal or the run is being cancelled.
    fn trial_started(&self, trial_id: &str) -> ControlResult<bool>;
    fn status_changed(&self, trial_id: &str, status: TrialStatus) -> ControlResult<()>;
    fn checkpoint_committed(&self, trial_id: &str, checkpoint: &CheckpointRef) -> ControlResult<()>;
    /// Records the terminal state. Returns the run's terminal status when
    /// this trial was the last one outstanding.
    fn trial_finished(&self, outcome: &TrialOutcome) -> ControlResult<Option<RunStatus>>;
}

#[derive(Debug)]
pub struct RunOperationLock {
    path: PathBuf,
}

impl Drop for RunOperationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn operation_lock_path(run_dir: &Path) -> PathBuf {
    run_dir.join("runtime").join("operation.lock")
}

/// Exclusive claim on a run directory. A live `lab run` holds it for the
/// whole dispatch; offline fork/replay take it for their duration.
pub fn acquire_run_operation_lock(run_dir: &Path) -> ControlResult<RunOperationLock> {
    let lock_path = operation_lock_path(run_dir);
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(RunOperationLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(ControlError::OperationInProgress)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn run_control_path(run_dir: &Path) -> PathBuf {
    run_dir.join("runtime").join("run_control.json")
}

fn versioned<T: Serialize>(schema_version: &str, record: &T) -> ControlResult<Value> {
    let mut value = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut value {
        map.insert("schema_version".to_string(), json!(schema_version));
    }
    Ok(value)
}

pub(crate) fn write_trial_record(path: &Path, trial: &Trial) -> ControlResult<()> {
    atomic_write_json_pretty(path, &versioned(TRIAL_STATE_SCHEMA, trial)?)?;
    Ok(())
}

fn read_trial_record(path: &Path) -> ControlResult<Trial> {
    let value = load_json_file(path)?;
    serde_json::from_value(value)
        .map_err(|e| ControlError::Storage(format!("{}: {}", path.display(), e)))
}

struct LedgerState {
    run: Run,
    trials: BTreeMap<String, Trial>,
}

/// Authoritative run and trial records for one run directory. Every mutation
/// happens under one lock and is persisted before the lock is released, so
/// the on-disk records never disagree with each other about ordering.
pub struct RunLedger {
    run_dir: PathBuf,
    state: Mutex<LedgerState>,
    changed: Condvar,
}

impl RunLedger {
    pub fn create(run_dir: &Path, mut run: Run, trials: Vec<Trial>) -> ControlResult<Self> {
        run.trial_ids = trials.iter().map(|t| t.trial_id.clone()).collect();
        run.counters = RunCounters::tally(trials.iter().map(|t| t.status));
        let ledger = Self {
            run_dir: run_dir.to_path_buf(),
            state: Mutex::new(LedgerState {
                run,
                trials: trials
                    .into_iter()
                    .map(|t| (t.trial_id.clone(), t))
                    .collect(),
            }),
            changed: Condvar::new(),
        };
        {
            let state = ledger.lock()?;
            for trial in state.trials.values() {
                ledger.persist_trial(trial)?;
            }
            ledger.persist_run(&state.run)?;
        }
        Ok(ledger)
    }

    pub fn load(run_dir: &Path) -> ControlResult<Self> {
        let run_value = load_json_file(&run_control_path(run_dir))?;
        let run: Run = serde_json::from_value(run_value)
            .map_err(|e| ControlError::Storage(format!("run_control.json: {}", e)))?;
        let mut trials = BTreeMap::new();
        let trials_dir = run_dir.join("trials");
        if trials_dir.exists() {
            for entry in fs::read_dir(&trials_dir)? {
                let entry = entry?;
                let record = entry.path().join("trial_state.json");
                if record.exists() {
                    let trial = read_trial_record(&record)?;
                    trials.insert(trial.trial_id.clone(), trial);
                }
            }
        }
        for id in &run.trial_ids {
            if !trials.contains_key(id) {
                return Err(ControlError::Storage(format!(
                    "run {} lists trial {} but no record exists",
                    run.run_id, id
                )));
            }
        }
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            state: Mutex::new(LedgerState { run, trials }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> ControlResult<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| ControlError::Storage("run ledger lock poisoned".to_string()))
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn trial_dir(&self, trial_id: &str) -> PathBuf {
        self.run_dir.join("trials").join(trial_id)
    }

    fn persist_trial(&self, trial: &Trial) -> ControlResult<()> {
        write_trial_record(
            &self.trial_dir(&trial.trial_id).join("trial_state.json"),
            trial,
        )
    }

    fn persist_run(&self, run: &Run) -> ControlResult<()> {
        atomic_write_json_pretty(
            &run_control_path(&self.run_dir),
            &versioned(RUN_CONTROL_SCHEMA, run)?,
        )?;
        Ok(())
    }

    pub fn run(&self) -> ControlResult<Run> {
        Ok(self.lock()?.run.clone())
    }

    pub fn status(&self) -> ControlResult<RunStatus> {
        Ok(self.lock()?.run.status)
    }

    pub fn trial(&self, trial_id: &str) -> ControlResult<Trial> {
        self.lock()?
            .trials
            .get(trial_id)
            .cloned()
            .ok_or_else(|| ControlError::TrialNotFound(trial_id.to_string()))
    }

    /// All trial records, including derived ones, in schedule order.
    pub fn trials(&self) -> ControlResult<Vec<Trial>> {
        let mut trials: Vec<Trial> = self.lock()?.trials.values().cloned().collect();
        trials.sort_by(|a, b| {
            a.schedule_index
                .cmp(&b.schedule_index)
                .then_with(|| a.trial_id.cmp(&b.trial_id))
        });
        Ok(trials)
    }

    pub fn is_cancel_requested(&self) -> ControlResult<bool> {
        Ok(self.lock()?.run.cancel_requested)
    }

    /// pending -> running. Fails on a run that already reached a terminal status.
    pub fn begin_dispatch(&self) -> ControlResult<()> {
        let mut state = self.lock()?;
        if state.run.status.is_terminal() {
            return Err(ControlError::RunAlreadyTerminal {
                run_id: state.run.run_id.clone(),
                status: state.run.status.to_string(),
            });
        }
        if state.run.status == RunStatus::Pending {
            state.run.status = RunStatus::Running;
            info!(run_id = %state.run.run_id, "run status: running");
        }
        // a reopened run may have nothing left to dispatch
        self.settle(&mut state)?;
        Ok(())
    }

    /// Flags the run cancelled and moves every pending trial straight to
    /// cancelled. Returns the ids of trials that are still live.
    pub fn request_cancel(&self) -> ControlResult<Vec<String>> {
        let mut state = self.lock()?;
        if state.run.status.is_terminal() {
            return Err(ControlError::RunAlreadyTerminal {
                run_id: state.run.run_id.clone(),
                status: state.run.status.to_string(),
            });
        }
        state.run.cancel_requested = true;
        let mut live = Vec::new();
        let now = Utc::now();
        let ids: Vec<String> = state.trials.keys().cloned().collect();
        for id in ids {
            let Some(trial) = state.trials.get_mut(&id) else {
                continue;
            };
            match trial.status {
                TrialStatus::Pending => {
                    trial.status = TrialStatus::Cancelled;
                    trial.updated_at = now;
                    let snapshot = trial.clone();
                    self.persist_trial(&snapshot)?;
                }
                TrialStatus::Running | TrialStatus::Paused => live.push(id),
                _ => {}
            }
        }
        info!(run_id = %state.run.run_id, live = live.len(), "cancel requested");
        self.settle(&mut state)?;
        Ok(live)
    }

    /// Registers a derived trial. `build` receives the fresh trial id and the
    /// next schedule index. A terminal run keeps its status record as is; the
    /// trial is still persisted as an audit record.
    pub fn add_trial(
        &self,
        build: impl FnOnce(String, usize) -> Trial,
    ) -> ControlResult<Trial> {
        let mut state = self.lock()?;
        let schedule_index = state
            .trials
            .values()
            .map(|t| t.schedule_index + 1)
            .max()
            .unwrap_or(0);
        let mut n = schedule_index + 1;
        let trial_id = loop {
            let candidate = format!("trial_{:03}", n);
            if !state.trials.contains_key(&candidate) {
                break candidate;
            }
            n += 1;
        };
        let trial = build(trial_id.clone(), schedule_index);
        self.persist_trial(&trial)?;
        state.trials.insert(trial_id.clone(), trial.clone());
        if !state.run.status.is_terminal() {
            state.run.trial_ids.push(trial_id);
            self.settle(&mut state)?;
        }
        Ok(trial)
    }

    pub fn update_bindings(&self, trial_id: &str, bindings: Value) -> ControlResult<()> {
        let mut state = self.lock()?;
        let trial = state
            .trials
            .get_mut(trial_id)
            .ok_or_else(|| ControlError::TrialNotFound(trial_id.to_string()))?;
        trial.bindings = bindings;
        trial.updated_at = Utc::now();
        let snapshot = trial.clone();
        self.persist_trial(&snapshot)
    }

    /// Blocks until the run is terminal or `timeout` elapses.
    pub fn wait_terminal(&self, timeout: Option<Duration>) -> ControlResult<RunStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock()?;
        loop {
            if state.run.status.is_terminal() {
                return Ok(state.run.status);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(state.run.status);
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| ControlError::Storage("run ledger lock poisoned".to_string()))?
                        .0
                }
                None => self
                    .changed
                    .wait(state)
                    .map_err(|_| ControlError::Storage("run ledger lock poisoned".to_string()))?,
            };
        }
    }

    /// Fails every non-terminal trial, then the run. Used when dispatch
    /// aborts and when a run is reopened after its control process died.
    pub fn fail_unfinished(&self, code: &str, message: &str) -> ControlResult<()> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let ids: Vec<String> = state
            .trials
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.trial_id.clone())
            .collect();
        for id in &ids {
            if let Some(trial) = state.trials.get_mut(id) {
                trial.status = TrialStatus::Failed;
                trial.failure = Some(ErrorEnvelope::new(
                    code,
                    message,
                    json!({ "trial_id": id }),
                ));
                trial.updated_at = now;
                let snapshot = trial.clone();
                self.persist_trial(&snapshot)?;
            }
        }
        if !ids.is_empty() {
            warn!(run_id = %state.run.run_id, trials = ids.len(), code, "failed unfinished trials");
        }
        if !state.run.status.is_terminal() && state.run.status != RunStatus::Pending {
            state.run.counters = RunCounters::tally(state.trials.values().map(|t| t.status));
            state.run.status = RunStatus::Failed;
            state.run.updated_at = now;
            self.persist_run(&state.run)?;
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Trials recorded as running or paused by a control process that no
    /// longer exists. Only safe to call while holding the operation lock.
    pub fn recover_orphans(&self) -> ControlResult<Vec<String>> {
        let mut state = self.lock()?;
        let ids: Vec<String> = state
            .trials
            .values()
            .filter(|t| matches!(t.status, TrialStatus::Running | TrialStatus::Paused))
            .map(|t| t.trial_id.clone())
            .collect();
        for id in &ids {
            let mut trial = self.transition(&mut state, id, TrialStatus::Failed)?;
            trial.failure = Some(ErrorEnvelope::new(
                "orphaned",
                "control process exited while the trial was live",
                json!({ "trial_id": id }),
            ));
            self.persist_trial(&trial)?;
            state.trials.insert(id.clone(), trial);
        }
        if !ids.is_empty() {
            warn!(run_id = %state.run.run_id, trials = ids.len(), "recovered orphaned trials");
            self.settle(&mut state)?;
        }
        Ok(ids)
    }

    /// Recounts and, once every trial is terminal, decides the run's terminal
    /// status. Caller holds the lock, so only one trial can make the decision.
    fn settle(&self, state: &mut MutexGuard<'_, LedgerState>) -> ControlResult<Option<RunStatus>> {
        if state.run.status.is_terminal() {
            return Ok(None);
        }
        let counters = RunCounters::tally(state.trials.values().map(|t| t.status));
        state.run.peak_running = state.run.peak_running.max(counters.running);
        let mut decided = None;
        if counters.all_terminal()
            && (state.run.status == RunStatus::Running || state.run.cancel_requested)
        {
            let next = if state.run.cancel_requested {
                RunStatus::Cancelled
            } else if counters.completed == counters.total {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            };
            if state.run.status.can_transition_to(next) {
                state.run.status = next;
                decided = Some(next);
            }
        }
        state.run.counters = counters;
        state.run.updated_at = Utc::now();
        self.persist_run(&state.run)?;
        if let Some(status) = decided {
            info!(
                run_id = %state.run.run_id,
                status = %status,
                completed = state.run.counters.completed,
                failed = state.run.counters.failed,
                cancelled = state.run.counters.cancelled,
                "run reached terminal status"
            );
        }
        self.changed.notify_all();
        Ok(decided)
    }

    fn transition(
        &self,
        state: &mut MutexGuard<'_, LedgerState>,
        trial_id: &str,
        next: TrialStatus,
    ) -> ControlResult<Trial> {
        let trial = state
            .trials
            .get_mut(trial_id)
            .ok_or_else(|| ControlError::TrialNotFound(trial_id.to_string()))?;
        if !trial.status.can_transition_to(next) {
            return Err(ControlError::InvalidTransition {
                trial_id: trial_id.to_string(),
                from: trial.status.to_string(),
                to: next.to_string(),
            });
        }
        trial.status = next;
        trial.updated_at = Utc::now();
        Ok(trial.clone())
    }
}

impl TrialSink for RunLedger {
    fn trial_started(&self, trial_id: &str) -> ControlResult<bool> {
        let mut state = self.lock()?;
        let current = state
            .trials
            .get(trial_id)
            .map(|t| t.status)
            .ok_or_else(|| ControlError::TrialNotFound(trial_id.to_string()))?;
        if current.is_terminal() {
            return Ok(false);
        }
        let next = if state.run.cancel_requested && !state.run.status.is_terminal() {
            TrialStatus::Cancelled
        } else {
            TrialStatus::Running
        };
        let trial = self.transition(&mut state, trial_id, next)?;
        self.persist_trial(&trial)?;
        self.settle(&mut state)?;
        Ok(next == TrialStatus::Running)
    }

    fn status_changed(&self, trial_id: &str, status: TrialStatus) -> ControlResult<()> {
        let mut state = self.lock()?;
        let trial = self.transition(&mut state, trial_id, status)?;
        self.persist_trial(&trial)?;
        self.settle(&mut state)?;
        Ok(())
    }

    fn checkpoint_committed(&self, trial_id: &str, checkpoint: &CheckpointRef) -> ControlResult<()> {
        let mut state = self.lock()?;
        let trial = state
            .trials
            .get_mut(trial_id)
            .ok_or_else(|| ControlError::TrialNotFound(trial_id.to_string()))?;
        trial.checkpoints.push(checkpoint.clone());
        trial.updated_at = Utc::now();
        let snapshot = trial.clone();
        self.persist_trial(&snapshot)
    }

    fn trial_finished(&self, outcome: &TrialOutcome) -> ControlResult<Option<RunStatus>> {
        let mut state = self.lock()?;
        let mut trial = self.transition(&mut state, &outcome.trial_id, outcome.status)?;
        trial.result = outcome.result.clone();
        trial.failure = outcome.failure.clone();
        trial.exit_code = outcome.exit_code;
        self.persist_trial(&trial)?;
        state.trials.insert(trial.trial_id.clone(), trial);
        self.settle(&mut state)
    }
}

/// Fails the run if dispatch unwinds before every trial finished.
pub(crate) struct DispatchGuard<'a> {
    ledger: &'a RunLedger,
    done: bool,
}

impl<'a> DispatchGuard<'a> {
    pub(crate) fn new(ledger: &'a RunLedger) -> Self {
        Self {
            ledger,
            done: false,
        }
    }

    pub(crate) fn complete(&mut self) {
        self.done = true;
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self
                .ledger
                .fail_unfinished("dispatch_aborted", "dispatch aborted before the trial finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_ledger as ledger, sample_trial as trial, TempDirGuard};

    fn finish(ledger: &RunLedger, id: &str, status: TrialStatus) -> Option<RunStatus> {
        let outcome = TrialOutcome {
            trial_id: id.to_string(),
            status,
            result: None,
            failure: None,
            exit_code: Some(0),
            checkpoint_labels: Vec::new(),
        };
        ledger.trial_finished(&outcome).expect("finish")
    }

    #[test]
    fn run_operation_lock_is_exclusive() {
        let dir = TempDirGuard::new("ledger_lock");
        let lock1 = acquire_run_operation_lock(&dir.path).expect("first lock must succeed");
        let err = acquire_run_operation_lock(&dir.path).expect_err("second lock must fail");
        assert_eq!(err.code(), "operation_in_progress");
        drop(lock1);
        let lock2 = acquire_run_operation_lock(&dir.path).expect("lock should be re-acquirable");
        drop(lock2);
    }

    #[test]
    fn last_trial_decides_terminal_status_once() {
        let dir = TempDirGuard::new("ledger_settle");
        let ledger = ledger(&dir.path, 2);
        ledger.begin_dispatch().expect("dispatch");
        assert!(ledger.trial_started("trial_001").expect("start"));
        assert!(ledger.trial_started("trial_002").expect("start"));
        assert_eq!(finish(&ledger, "trial_001", TrialStatus::Completed), None);
        assert_eq!(
            finish(&ledger, "trial_002", TrialStatus::Failed),
            Some(RunStatus::Failed)
        );
        let run = ledger.run().expect("run");
        assert_eq!(run.counters.completed, 1);
        assert_eq!(run.counters.failed, 1);
        assert_eq!(run.peak_running, 2);

        let persisted = load_json_file(&run_control_path(&dir.path)).expect("run_control");
        assert_eq!(persisted["schema_version"], RUN_CONTROL_SCHEMA);
        assert_eq!(persisted["status"], "failed");
    }

    #[test]
    fn terminal_run_rejects_dispatch_and_cancel() {
        let dir = TempDirGuard::new("ledger_terminal");
        let ledger = ledger(&dir.path, 1);
        ledger.begin_dispatch().expect("dispatch");
        ledger.trial_started("trial_001").expect("start");
        finish(&ledger, "trial_001", TrialStatus::Completed);
        assert_eq!(ledger.status().expect("status"), RunStatus::Completed);
        assert_eq!(
            ledger.begin_dispatch().expect_err("terminal").code(),
            "run_already_terminal"
        );
        assert_eq!(
            ledger.request_cancel().expect_err("terminal").code(),
            "run_already_terminal"
        );
        ledger.fail_unfinished("x", "y").expect("noop");
        assert_eq!(ledger.status().expect("status"), RunStatus::Completed);
    }

    #[test]
    fn cancel_before_dispatch_cancels_pending_trials_and_run() {
        let dir = TempDirGuard::new("ledger_cancel");
        let ledger = ledger(&dir.path, 3);
        let live = ledger.request_cancel().expect("cancel");
        assert!(live.is_empty());
        assert_eq!(ledger.status().expect("status"), RunStatus::Cancelled);
        assert!(ledger
            .trials()
            .expect("trials")
            .iter()
            .all(|t| t.status == TrialStatus::Cancelled));
    }

    #[test]
    fn derived_trial_after_terminal_run_leaves_status_record_alone() {
        let dir = TempDirGuard::new("ledger_derived");
        let ledger = ledger(&dir.path, 1);
        ledger.begin_dispatch().expect("dispatch");
        ledger.trial_started("trial_001").expect("start");
        finish(&ledger, "trial_001", TrialStatus::Completed);
        let before = load_json_file(&run_control_path(&dir.path)).expect("before");

        let added = ledger
            .add_trial(|id, idx| trial(&id, idx))
            .expect("add");
        assert_eq!(added.trial_id, "trial_002");
        assert_eq!(added.schedule_index, 1);
        ledger.trial_started("trial_002").expect("start");
        finish(&ledger, "trial_002", TrialStatus::Failed);

        let after = load_json_file(&run_control_path(&dir.path)).expect("after");
        assert_eq!(before, after);
        assert_eq!(ledger.status().expect("status"), RunStatus::Completed);

        let reloaded = RunLedger::load(&dir.path).expect("reload");
        assert_eq!(reloaded.trials().expect("trials").len(), 2);
    }

    #[test]
    fn reopened_ledger_fails_orphaned_trials_only() {
        let dir = TempDirGuard::new("ledger_orphans");
        {
            let ledger = ledger(&dir.path, 2);
            ledger.begin_dispatch().expect("dispatch");
            ledger.trial_started("trial_001").expect("start");
        }
        let reopened = RunLedger::load(&dir.path).expect("load");
        let orphans = reopened.recover_orphans().expect("recover");
        assert_eq!(orphans, vec!["trial_001".to_string()]);
        let orphan = reopened.trial("trial_001").expect("trial");
        assert_eq!(orphan.status, TrialStatus::Failed);
        assert_eq!(orphan.failure.map(|f| f.code), Some("orphaned".to_string()));
        assert_eq!(
            reopened.trial("trial_002").expect("trial").status,
            TrialStatus::Pending
        );
        assert_eq!(reopened.status().expect("status"), RunStatus::Running);
    }

    #[test]
    fn invalid_trial_transition_is_rejected() {
        let dir = TempDirGuard::new("ledger_transition");
        let ledger = ledger(&dir.path, 1);
        let err = ledger
            .status_changed("trial_001", TrialStatus::Paused)
            .expect_err("pending cannot pause");
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn dispatch_guard_fails_unfinished_trials_on_drop() {
        let dir = TempDirGuard::new("ledger_guard");
        let ledger = ledger(&dir.path, 2);
        ledger.begin_dispatch().expect("dispatch");
        ledger.trial_started("trial_001").expect("start");
        {
            let _guard = DispatchGuard::new(&ledger);
        }
        assert_eq!(ledger.status().expect("status"), RunStatus::Failed);
        let trials = ledger.trials().expect("trials");
        assert!(trials.iter().all(|t| t.status == TrialStatus::Failed));
        assert_eq!(
            trials[0].failure.as_ref().map(|f| f.code.as_str()),
            Some("dispatch_aborted")
        );
    }
}
