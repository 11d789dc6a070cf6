//! Cooperative suspension of running trials.
//!
//! Every trial has a [`TrialGate`]. The executor reports each committed
//! checkpoint to the gate; when a caller has armed that label with
//! [`PauseCoordinator::pause`], the executor blocks inside the gate until
//! [`PauseCoordinator::resume`] or cancellation releases it. A harness only
//! ever stops at boundaries it declares itself.

use crate::checkpoint::CheckpointStore;
use crate::error::{ControlError, ControlResult};
use crate::knobs::{merge_bindings, KnobEngine};
use crate::ledger::{RunLedger, TrialSink};
use crate::model::{CheckpointRef, TrialStatus};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What the harness is told after a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Keep going. `bindings` carries the full binding set when a resume
    /// changed it.
    Continue { bindings: Option<Value> },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Cancelled,
    TimedOut,
}

struct GateState {
    status: TrialStatus,
    last_checkpoint: Option<CheckpointRef>,
    armed: BTreeMap<String, usize>,
    hits: BTreeMap<String, CheckpointRef>,
    held: bool,
    resume_bindings: Option<Value>,
    cancel_at: Option<Instant>,
    process_exited: bool,
}

pub struct TrialGate {
    trial_id: String,
    state: Mutex<GateState>,
    changed: Condvar,
    operation: Mutex<()>,
}

impl TrialGate {
    pub fn new(trial_id: &str) -> Self {
        Self {
            trial_id: trial_id.to_string(),
            state: Mutex::new(GateState {
                status: TrialStatus::Pending,
                last_checkpoint: None,
                armed: BTreeMap::new(),
                hits: BTreeMap::new(),
                held: false,
                resume_bindings: None,
                cancel_at: None,
                process_exited: false,
            }),
            changed: Condvar::new(),
            operation: Mutex::new(()),
        }
    }

    pub fn trial_id(&self) -> &str {
        &self.trial_id
    }

    fn lock(&self) -> ControlResult<MutexGuard<'_, GateState>> {
        self.state
            .lock()
            .map_err(|_| ControlError::Storage(format!("gate {} poisoned", self.trial_id)))
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GateState>) -> ControlResult<MutexGuard<'a, GateState>> {
        self.changed
            .wait(guard)
            .map_err(|_| ControlError::Storage(format!("gate {} poisoned", self.trial_id)))
    }

    /// Exclusive per-trial operation lock taken by resume and fork.
    pub fn operation(&self) -> ControlResult<MutexGuard<'_, ()>> {
        self.operation
            .lock()
            .map_err(|_| ControlError::Storage(format!("gate {} poisoned", self.trial_id)))
    }

    pub fn status(&self) -> ControlResult<TrialStatus> {
        Ok(self.lock()?.status)
    }

    pub fn is_held(&self) -> ControlResult<bool> {
        Ok(self.lock()?.held)
    }

    pub fn last_checkpoint(&self) -> ControlResult<Option<CheckpointRef>> {
        Ok(self.lock()?.last_checkpoint.clone())
    }

    pub fn start(&self) -> ControlResult<()> {
        let mut state = self.lock()?;
        state.status = TrialStatus::Running;
        state.process_exited = false;
        self.changed.notify_all();
        Ok(())
    }

    /// Called by the executor after `checkpoint` is durably committed. Blocks
    /// while a pause holds the trial at this checkpoint.
    pub fn checkpoint_reached(
        &self,
        checkpoint: &CheckpointRef,
        sink: &dyn TrialSink,
    ) -> ControlResult<Directive> {
        let mut state = self.lock()?;
        state.last_checkpoint = Some(checkpoint.clone());
        if state.cancel_at.is_some() {
            return Ok(Directive::Stop);
        }
        if state.armed.remove(&checkpoint.label).is_none() {
            self.changed.notify_all();
            return Ok(Directive::Continue { bindings: None });
        }

        sink.status_changed(&self.trial_id, TrialStatus::Paused)?;
        state.status = TrialStatus::Paused;
        state.held = true;
        state.resume_bindings = None;
        state
            .hits
            .insert(checkpoint.label.clone(), checkpoint.clone());
        self.changed.notify_all();
        info!(
            trial_id = %self.trial_id,
            label = %checkpoint.label,
            sequence_number = checkpoint.sequence_number,
            "trial paused"
        );

        while state.held && state.cancel_at.is_none() {
            state = self.wait(state)?;
        }
        if state.cancel_at.is_some() {
            state.held = false;
            return Ok(Directive::Stop);
        }
        let bindings = state.resume_bindings.take();
        sink.status_changed(&self.trial_id, TrialStatus::Running)?;
        state.status = TrialStatus::Running;
        self.changed.notify_all();
        info!(trial_id = %self.trial_id, label = %checkpoint.label, "trial resumed");
        Ok(Directive::Continue { bindings })
    }

    /// Flags the trial for cooperative stop and wakes it if suspended.
    pub fn request_cancel(&self) -> ControlResult<()> {
        let mut state = self.lock()?;
        if state.cancel_at.is_none() && !state.status.is_terminal() {
            state.cancel_at = Some(Instant::now());
            debug!(trial_id = %self.trial_id, "cancel signalled");
        }
        self.changed.notify_all();
        Ok(())
    }

    pub fn is_cancel_requested(&self) -> ControlResult<bool> {
        Ok(self.lock()?.cancel_at.is_some())
    }

    /// Watchdog check: a cancelled trial past its grace period, or a running
    /// trial past its deadline, must be killed. Time spent held is exempt from
    /// the deadline.
    pub fn kill_reason(&self, grace: Duration, deadline: Option<Instant>) -> ControlResult<Option<KillReason>> {
        let state = self.lock()?;
        if state.process_exited {
            return Ok(None);
        }
        if let Some(at) = state.cancel_at {
            if at.elapsed() >= grace {
                return Ok(Some(KillReason::Cancelled));
            }
        }
        if let Some(deadline) = deadline {
            if !state.held && Instant::now() >= deadline {
                return Ok(Some(KillReason::TimedOut));
            }
        }
        Ok(None)
    }

    pub fn process_exited(&self) -> ControlResult<()> {
        let mut state = self.lock()?;
        state.process_exited = true;
        state.held = false;
        self.changed.notify_all();
        Ok(())
    }

    pub fn has_process_exited(&self) -> ControlResult<bool> {
        Ok(self.lock()?.process_exited)
    }

    /// Records the terminal status and wakes every pause waiter.
    pub fn finish(&self, status: TrialStatus) -> ControlResult<()> {
        let mut state = self.lock()?;
        state.status = status;
        state.process_exited = true;
        state.held = false;
        state.armed.clear();
        self.changed.notify_all();
        Ok(())
    }

    fn disarm(state: &mut GateState, label: &str) {
        if let Some(count) = state.armed.get_mut(label) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.armed.remove(label);
            }
        }
    }
}

/// Result of [`PauseCoordinator::pause`]. `held` is false when the label had
/// already been passed and the trial kept running; only a held trial can be
/// resumed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PauseOutcome {
    pub trial_id: String,
    pub checkpoint: CheckpointRef,
    pub held: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeOutcome {
    pub trial_id: String,
    pub label: String,
    pub sequence_number: u64,
    pub bindings: Value,
}

/// Brokers pause/resume between callers and running executors.
pub struct PauseCoordinator {
    gates: Mutex<BTreeMap<String, Arc<TrialGate>>>,
    store: Arc<CheckpointStore>,
    ledger: Arc<RunLedger>,
    knobs: Arc<KnobEngine>,
}

impl PauseCoordinator {
    pub fn new(store: Arc<CheckpointStore>, ledger: Arc<RunLedger>, knobs: Arc<KnobEngine>) -> Self {
        Self {
            gates: Mutex::new(BTreeMap::new()),
            store,
            ledger,
            knobs,
        }
    }

    fn gates(&self) -> ControlResult<MutexGuard<'_, BTreeMap<String, Arc<TrialGate>>>> {
        self.gates
            .lock()
            .map_err(|_| ControlError::Storage("gate registry poisoned".to_string()))
    }

    pub fn register(&self, trial_id: &str) -> ControlResult<Arc<TrialGate>> {
        Ok(self
            .gates()?
            .entry(trial_id.to_string())
            .or_insert_with(|| Arc::new(TrialGate::new(trial_id)))
            .clone())
    }

    pub fn gate(&self, trial_id: &str) -> ControlResult<Arc<TrialGate>> {
        self.gates()?
            .get(trial_id)
            .cloned()
            .ok_or_else(|| ControlError::TrialNotFound(trial_id.to_string()))
    }

    /// Waits until `trial_id` reaches or has already passed a checkpoint
    /// labelled `label`. Only the caller blocks.
    pub fn pause(&self, trial_id: &str, label: &str, timeout: Duration) -> ControlResult<PauseOutcome> {
        let gate = match self.gate(trial_id) {
            Ok(gate) => gate,
            Err(err) => {
                let trial = self.ledger.trial(trial_id)?;
                if trial.status.is_terminal() {
                    return Err(ControlError::PauseAlreadyTerminal {
                        trial_id: trial_id.to_string(),
                        status: trial.status.to_string(),
                    });
                }
                return Err(err);
            }
        };
        let deadline = Instant::now() + timeout;
        let mut state = gate.lock()?;
        if self.store.contains_label(trial_id, label)? {
            let checkpoint = self.store.get(trial_id, label)?;
            let held = state.held
                && state
                    .last_checkpoint
                    .as_ref()
                    .is_some_and(|c| c.sequence_number == checkpoint.sequence_number);
            if !held {
                info!(trial_id, label, "pause label already passed; trial not held");
            }
            return Ok(PauseOutcome {
                trial_id: trial_id.to_string(),
                checkpoint: checkpoint.reference(),
                held,
            });
        }
        if state.status.is_terminal() {
            return Err(ControlError::PauseAlreadyTerminal {
                trial_id: trial_id.to_string(),
                status: state.status.to_string(),
            });
        }
        *state.armed.entry(label.to_string()).or_insert(0) += 1;
        debug!(trial_id, label, timeout_ms = timeout.as_millis() as u64, "pause armed");

        loop {
            if let Some(hit) = state.hits.get(label) {
                return Ok(PauseOutcome {
                    trial_id: trial_id.to_string(),
                    checkpoint: hit.clone(),
                    held: state.held,
                });
            }
            if state.status.is_terminal() {
                TrialGate::disarm(&mut state, label);
                return Err(ControlError::PauseAlreadyTerminal {
                    trial_id: trial_id.to_string(),
                    status: state.status.to_string(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                TrialGate::disarm(&mut state, label);
                return Err(ControlError::PauseTimeout {
                    trial_id: trial_id.to_string(),
                    label: label.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            state = gate
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(|_| ControlError::Storage(format!("gate {} poisoned", trial_id)))?
                .0;
        }
    }

    /// Releases a suspended trial. `label` must name its most recent
    /// checkpoint. Binding overrides are validated strictly before anything
    /// changes.
    pub fn resume(
        &self,
        trial_id: &str,
        label: &str,
        overrides: Option<&BTreeMap<String, Value>>,
    ) -> ControlResult<ResumeOutcome> {
        let gate = self.gate(trial_id)?;
        let _operation = gate.operation()?;
        let mut state = gate.lock()?;
        if !state.held {
            return Err(ControlError::InvalidTransition {
                trial_id: trial_id.to_string(),
                from: state.status.to_string(),
                to: TrialStatus::Running.to_string(),
            });
        }
        let latest = self.store.latest(trial_id)?.ok_or_else(|| {
            ControlError::CheckpointNotFound {
                trial_id: trial_id.to_string(),
                selector: format!("checkpoint:{}", label),
            }
        })?;
        if latest.label != label {
            return Err(ControlError::CheckpointMismatch {
                trial_id: trial_id.to_string(),
                expected: label.to_string(),
                found: latest.label,
            });
        }

        let mut bindings = self.ledger.trial(trial_id)?.bindings;
        let mut changed = None;
        if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
            self.knobs.validate_bindings(overrides, true)?;
            bindings = merge_bindings(&bindings, overrides)?;
            self.ledger.update_bindings(trial_id, bindings.clone())?;
            changed = Some(bindings.clone());
        }
        state.resume_bindings = changed;
        state.held = false;
        gate.changed.notify_all();
        info!(trial_id, label, sequence_number = latest.sequence_number, "resume signalled");
        Ok(ResumeOutcome {
            trial_id: trial_id.to_string(),
            label: label.to_string(),
            sequence_number: latest.sequence_number,
            bindings,
        })
    }

    pub fn cancel_all(&self) -> ControlResult<()> {
        let gates: Vec<Arc<TrialGate>> = self.gates()?.values().cloned().collect();
        for gate in gates {
            gate.request_cancel()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::KnobManifest;
    use crate::test_support::{sample_ledger, TempDirGuard};
    use serde_json::json;
    use std::thread;

    struct Fixture {
        _dir: TempDirGuard,
        store: Arc<CheckpointStore>,
        ledger: Arc<RunLedger>,
        coordinator: Arc<PauseCoordinator>,
    }

    fn fixture(prefix: &str) -> Fixture {
        let dir = TempDirGuard::new(prefix);
        let store = Arc::new(CheckpointStore::open(&dir.path.join("checkpoints")).expect("store"));
        let ledger = Arc::new(sample_ledger(&dir.path, 1));
        let manifest = KnobManifest::from_value(json!({
            "schema_version": "knob_manifest_v1",
            "knobs": [{
                "id": "temperature",
                "json_pointer": "/baseline/bindings/temperature",
                "type": "number",
                "minimum": 0,
                "maximum": 2
            }]
        }))
        .expect("manifest");
        let knobs = Arc::new(KnobEngine::new(manifest).expect("engine"));
        let coordinator = Arc::new(PauseCoordinator::new(store.clone(), ledger.clone(), knobs));
        coordinator.register("trial_001").expect("register");
        ledger.begin_dispatch().expect("dispatch");
        Fixture {
            _dir: dir,
            store,
            ledger,
            coordinator,
        }
    }

    /// Plays the executor side: commit checkpoints in order, honouring the gate.
    fn simulate_harness(
        fx: &Fixture,
        labels: &'static [&'static str],
        delay: Duration,
    ) -> thread::JoinHandle<Vec<Directive>> {
        let store = fx.store.clone();
        let ledger = fx.ledger.clone();
        let gate = fx.coordinator.gate("trial_001").expect("gate");
        thread::spawn(move || {
            ledger.trial_started("trial_001").expect("start");
            gate.start().expect("gate start");
            let mut directives = Vec::new();
            for label in labels {
                thread::sleep(delay);
                let cp = store
                    .append("trial_001", label, b"{}".to_vec())
                    .expect("append");
                ledger
                    .checkpoint_committed("trial_001", &cp.reference())
                    .expect("commit");
                let directive = gate
                    .checkpoint_reached(&cp.reference(), &*ledger)
                    .expect("reached");
                let stop = directive == Directive::Stop;
                directives.push(directive);
                if stop {
                    break;
                }
            }
            gate.process_exited().expect("exited");
            directives
        })
    }

    #[test]
    fn pause_holds_trial_at_label_until_resumed() {
        let fx = fixture("pause_hold");
        let harness = simulate_harness(&fx, &["step_1", "before_tool_call", "step_3"], Duration::from_millis(50));
        let paused = fx
            .coordinator
            .pause("trial_001", "before_tool_call", Duration::from_secs(5))
            .expect("pause");
        assert!(paused.held);
        assert_eq!(paused.checkpoint.label, "before_tool_call");
        assert_eq!(paused.checkpoint.sequence_number, 2);
        assert_eq!(
            fx.ledger.trial("trial_001").expect("trial").status,
            TrialStatus::Paused
        );

        let err = fx
            .coordinator
            .resume("trial_001", "step_1", None)
            .expect_err("label mismatch");
        assert_eq!(err.code(), "checkpoint_mismatch");

        let mut overrides = BTreeMap::new();
        overrides.insert("temperature".to_string(), json!(0.4));
        let outcome = fx
            .coordinator
            .resume("trial_001", "before_tool_call", Some(&overrides))
            .expect("resume");
        assert_eq!(outcome.bindings["temperature"], 0.4);

        let directives = harness.join().expect("harness thread");
        assert_eq!(directives.len(), 3);
        assert_eq!(
            directives[1],
            Directive::Continue {
                bindings: Some(outcome.bindings.clone())
            }
        );
        assert_eq!(
            fx.ledger.trial("trial_001").expect("trial").status,
            TrialStatus::Running
        );
    }

    #[test]
    fn resume_rejects_invalid_overrides_without_releasing() {
        let fx = fixture("pause_bad_resume");
        let harness = simulate_harness(&fx, &["a"], Duration::from_millis(50));
        fx.coordinator
            .pause("trial_001", "a", Duration::from_secs(5))
            .expect("pause");
        let mut overrides = BTreeMap::new();
        overrides.insert("temperature".to_string(), json!(3.5));
        overrides.insert("model".to_string(), json!("x"));
        let err = fx
            .coordinator
            .resume("trial_001", "a", Some(&overrides))
            .expect_err("invalid");
        match err {
            ControlError::ValidationFailed { violations } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
        assert!(fx.coordinator.gate("trial_001").expect("gate").is_held().expect("held"));
        fx.coordinator.resume("trial_001", "a", None).expect("resume");
        harness.join().expect("harness thread");
    }

    #[test]
    fn pause_times_out_when_label_never_reached() {
        let fx = fixture("pause_timeout");
        let harness = simulate_harness(&fx, &["a", "b"], Duration::from_millis(10));
        let err = fx
            .coordinator
            .pause("trial_001", "never", Duration::from_millis(300))
            .expect_err("timeout");
        assert_eq!(err.code(), "pause_timeout");
        harness.join().expect("harness thread");
    }

    #[test]
    fn pause_on_finished_trial_reports_terminal() {
        let fx = fixture("pause_terminal");
        let gate = fx.coordinator.gate("trial_001").expect("gate");
        gate.finish(TrialStatus::Completed).expect("finish");
        let err = fx
            .coordinator
            .pause("trial_001", "x", Duration::from_secs(1))
            .expect_err("terminal");
        assert_eq!(err.code(), "pause_already_terminal");
    }

    #[test]
    fn passed_label_returns_existing_checkpoint() {
        let fx = fixture("pause_passed");
        fx.store
            .append("trial_001", "warmup", b"{}".to_vec())
            .expect("append");
        let passed = fx
            .coordinator
            .pause("trial_001", "warmup", Duration::from_millis(10))
            .expect("passed");
        assert_eq!(passed.checkpoint.sequence_number, 1);
        assert!(!passed.held);
    }

    #[test]
    fn pause_after_label_passed_reports_not_held() {
        let fx = fixture("pause_passed_live");
        let gate = fx.coordinator.gate("trial_001").expect("gate");
        let harness = simulate_harness(&fx, &["before_tool_call", "done"], Duration::from_millis(10));
        while gate.last_checkpoint().expect("last").is_none() {
            thread::sleep(Duration::from_millis(5));
        }
        let passed = fx
            .coordinator
            .pause("trial_001", "before_tool_call", Duration::from_secs(1))
            .expect("passed");
        assert!(!passed.held);
        assert_eq!(passed.checkpoint.sequence_number, 1);
        let err = fx
            .coordinator
            .resume("trial_001", "before_tool_call", None)
            .expect_err("never held");
        assert_eq!(err.code(), "invalid_transition");
        let directives = harness.join().expect("harness thread");
        assert_eq!(directives.len(), 2);
        assert!(directives.iter().all(|d| *d == Directive::Continue { bindings: None }));
    }

    #[test]
    fn repeated_pause_on_held_label_reports_held() {
        let fx = fixture("pause_twice");
        let harness = simulate_harness(&fx, &["a", "b"], Duration::from_millis(50));
        let first = fx
            .coordinator
            .pause("trial_001", "a", Duration::from_secs(5))
            .expect("pause");
        let second = fx
            .coordinator
            .pause("trial_001", "a", Duration::from_millis(10))
            .expect("again");
        assert!(first.held && second.held);
        assert_eq!(first.checkpoint, second.checkpoint);
        fx.coordinator.resume("trial_001", "a", None).expect("resume");
        harness.join().expect("harness thread");
    }

    #[test]
    fn resume_requires_suspended_trial() {
        let fx = fixture("pause_not_held");
        let err = fx
            .coordinator
            .resume("trial_001", "a", None)
            .expect_err("not held");
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn cancel_releases_held_trial_with_stop() {
        let fx = fixture("pause_cancel");
        let harness = simulate_harness(&fx, &["a", "b"], Duration::from_millis(50));
        fx.coordinator
            .pause("trial_001", "a", Duration::from_secs(5))
            .expect("pause");
        fx.coordinator.cancel_all().expect("cancel");
        let directives = harness.join().expect("harness thread");
        assert_eq!(directives, vec![Directive::Stop]);
        let gate = fx.coordinator.gate("trial_001").expect("gate");
        assert_eq!(
            gate.kill_reason(Duration::from_secs(60), None).expect("reason"),
            None
        );
    }
}
