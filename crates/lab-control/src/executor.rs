//! Runs one trial as an external harness process.
//!
//! The harness talks to the executor over stdio. Each stdout line of the form
//! `{"event_type":"checkpoint","label":..,"step":..,"state":{..}}` is
//! committed to the checkpoint store and answered with one stdin line
//! `{"event_type":"control","action":"continue"|"stop",..}`. Any other JSON
//! line is remembered; the last one stands in for the result artifact when the
//! harness does not write `AGENTLAB_TRIAL_OUTPUT` itself.

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::{ContainerSpec, ControlTimings, ExperimentPlan, HarnessSpec, Sandbox};
use crate::error::{ControlError, ControlResult, ErrorEnvelope};
use crate::ledger::TrialSink;
use crate::model::{Trial, TrialResult, TrialStatus};
use crate::pause::{Directive, KillReason, TrialGate};
use lab_core::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, load_json_file, tail_lines,
    trial_host_paths, TrialHostPaths, AGENTLAB_CONTRACT_IN_DIR, AGENTLAB_CONTRACT_OUT_DIR,
    AGENTLAB_CONTRACT_STATE_DIR, AGENTLAB_CONTRACT_WORKSPACE_DIR, AGENTLAB_ENV_CONTROL_MODE,
    AGENTLAB_ENV_REPL_IDX, AGENTLAB_ENV_RESUME_LABEL, AGENTLAB_ENV_RESUME_STATE,
    AGENTLAB_ENV_RUN_ID, AGENTLAB_ENV_TASK_ID, AGENTLAB_ENV_TRIAL_ID, AGENTLAB_ENV_TRIAL_INPUT,
    AGENTLAB_ENV_TRIAL_OUTPUT, AGENTLAB_ENV_VARIANT_ID, AGENTLAB_RESUME_STATE_PATH,
    AGENTLAB_TRIAL_INPUT_PATH, AGENTLAB_TRIAL_OUTPUT_PATH,
};
use serde_json::{json, Map, Value};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_TAIL_LINES: usize = 20;
const WORKSPACE_EXCLUDES: &[&str] = &[
    ".lab",
    ".git",
    "node_modules",
    ".venv",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    "target",
    ".next",
    "coverage",
];

#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub trial_id: String,
    pub status: TrialStatus,
    pub result: Option<TrialResult>,
    pub exit_code: Option<i32>,
    pub failure: Option<ErrorEnvelope>,
    /// Labels the harness emitted during this execution, in order.
    pub checkpoint_labels: Vec<String>,
}

impl TrialOutcome {
    fn failed(trial_id: &str, failure: ErrorEnvelope, exit_code: Option<i32>, labels: Vec<String>) -> Self {
        Self {
            trial_id: trial_id.to_string(),
            status: TrialStatus::Failed,
            result: None,
            exit_code,
            failure: Some(failure),
            checkpoint_labels: labels,
        }
    }
}

/// State a trial starts from instead of the beginning.
#[derive(Debug, Clone)]
pub struct ResumeSeed {
    pub source_trial_id: String,
    pub label: String,
    pub sequence_number: u64,
    pub state: CheckpointState,
}

pub struct TrialJob<'a> {
    pub trial: Trial,
    pub trial_dir: PathBuf,
    pub gate: Arc<TrialGate>,
    pub store: &'a CheckpointStore,
    pub sink: &'a dyn TrialSink,
    pub resume: Option<ResumeSeed>,
}

#[derive(Default)]
struct StdoutSummary {
    labels: Vec<String>,
    last_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrialExecutor {
    harness: HarnessSpec,
    sandbox: Sandbox,
    timings: ControlTimings,
    base_dir: PathBuf,
}

impl TrialExecutor {
    pub fn new(harness: HarnessSpec, sandbox: Sandbox, timings: ControlTimings, base_dir: &Path) -> Self {
        Self {
            harness,
            sandbox,
            timings,
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn from_plan(plan: &ExperimentPlan) -> Self {
        Self::new(
            plan.harness.clone(),
            plan.sandbox.clone(),
            plan.timings,
            &plan.base_dir,
        )
    }

    fn is_container(&self) -> bool {
        matches!(self.sandbox, Sandbox::Container(_))
    }

    /// Runs the trial to a terminal status and records it through the sink.
    /// Returns `None` when the sink refused to start the trial.
    pub fn run(&self, job: TrialJob<'_>) -> ControlResult<Option<TrialOutcome>> {
        let TrialJob {
            trial,
            trial_dir,
            gate,
            store,
            sink,
            resume,
        } = job;
        let trial_id = trial.trial_id.clone();
        if !sink.trial_started(&trial_id)? {
            gate.finish(TrialStatus::Cancelled)?;
            debug!(trial_id = %trial_id, "trial skipped");
            return Ok(None);
        }
        gate.start()?;
        info!(
            run_id = %trial.run_id,
            trial_id = %trial_id,
            variant_id = %trial.variant_id,
            task_id = %trial.task_id,
            resumed_from = resume.as_ref().map(|s| s.label.as_str()).unwrap_or(""),
            "trial started"
        );

        let outcome = match self.execute(&trial, &trial_dir, &gate, store, sink, resume.as_ref()) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(trial_id = %trial_id, error = %err, "trial infrastructure failure");
                TrialOutcome::failed(&trial_id, err.envelope(), None, Vec::new())
            }
        };
        let recorded = sink.trial_finished(&outcome);
        gate.finish(outcome.status)?;
        recorded?;
        info!(
            trial_id = %trial_id,
            status = %outcome.status,
            exit_code = ?outcome.exit_code,
            checkpoints = outcome.checkpoint_labels.len(),
            "trial finished"
        );
        Ok(Some(outcome))
    }

    fn execute(
        &self,
        trial: &Trial,
        trial_dir: &Path,
        gate: &TrialGate,
        store: &CheckpointStore,
        sink: &dyn TrialSink,
        resume: Option<&ResumeSeed>,
    ) -> ControlResult<TrialOutcome> {
        let trial_id = trial.trial_id.as_str();
        let paths = trial_host_paths(trial_dir);
        paths.prepare()?;
        if let Some(seed) = resume {
            atomic_write_bytes(&paths.resume_state, &seed.state.to_bytes()?)?;
        }
        atomic_write_json_pretty(&paths.trial_input, &self.trial_input(trial, &paths, resume))?;

        let mut cmd = self.command(trial, &paths, resume)?;
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = ControlError::SpawnFailed {
                    trial_id: trial_id.to_string(),
                    message: e.to_string(),
                };
                warn!(trial_id, error = %err, "harness spawn failed");
                return Ok(TrialOutcome::failed(trial_id, err.envelope(), None, Vec::new()));
            }
        };
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Mutex::new(child);
        let killed: Mutex<Option<KillReason>> = Mutex::new(None);
        let deadline = self.timings.trial_timeout.map(|t| Instant::now() + t);

        let (pumped, exit_status, stderr_text) = thread::scope(|scope| {
            let stderr_reader = scope.spawn(move || {
                let mut bytes = Vec::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_end(&mut bytes);
                }
                String::from_utf8_lossy(&bytes).to_string()
            });
            let watchdog = scope.spawn(|| self.watch(gate, &child, &killed, deadline));

            let pumped = self.pump_stdout(trial, gate, store, sink, stdout, stdin);
            if pumped.is_err() {
                if let Ok(mut child) = child.lock() {
                    let _ = child.kill();
                }
            }
            let exit_status = wait_for_exit(&child);
            let _ = gate.process_exited();
            let _ = watchdog.join();
            let stderr_text = stderr_reader.join().unwrap_or_default();
            (pumped, exit_status, stderr_text)
        });
        let exit_status = exit_status?;
        let exit_code = exit_status.code();
        atomic_write_bytes(&paths.stderr_log, stderr_text.as_bytes())?;
        let stderr_tail = tail_lines(&stderr_text, STDERR_TAIL_LINES);

        let summary = match pumped {
            Ok(summary) => summary,
            Err(err) => {
                warn!(trial_id, error = %err, "checkpoint handling failed; harness killed");
                return Ok(TrialOutcome::failed(trial_id, err.envelope(), exit_code, Vec::new()));
            }
        };
        let killed = killed.lock().ok().and_then(|k| *k);

        if killed == Some(KillReason::TimedOut) {
            let timeout_ms = self
                .timings
                .trial_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(0);
            let err = ControlError::TrialCrashed {
                trial_id: trial_id.to_string(),
                exit_status: exit_code,
                diagnostic: format!("killed after exceeding trial timeout of {}ms\n{}", timeout_ms, stderr_tail),
            };
            return Ok(TrialOutcome::failed(trial_id, err.envelope(), exit_code, summary.labels));
        }
        if gate.is_cancel_requested()? {
            return Ok(TrialOutcome {
                trial_id: trial_id.to_string(),
                status: TrialStatus::Cancelled,
                result: None,
                exit_code,
                failure: None,
                checkpoint_labels: summary.labels,
            });
        }
        if !exit_status.success() {
            let err = ControlError::TrialCrashed {
                trial_id: trial_id.to_string(),
                exit_status: exit_code,
                diagnostic: stderr_tail,
            };
            warn!(trial_id, exit_code = ?exit_code, "harness exited unsuccessfully");
            return Ok(TrialOutcome::failed(trial_id, err.envelope(), exit_code, summary.labels));
        }

        match collect_result(&paths, summary.last_json.as_deref()) {
            Ok(result) if result.is_error() => {
                let failure = ErrorEnvelope::new(
                    "harness_error",
                    "harness reported outcome error",
                    json!({
                        "trial_id": trial_id,
                        "error": result.extra.get("error").cloned().unwrap_or(Value::Null),
                    }),
                );
                Ok(TrialOutcome {
                    trial_id: trial_id.to_string(),
                    status: TrialStatus::Failed,
                    result: Some(result),
                    exit_code,
                    failure: Some(failure),
                    checkpoint_labels: summary.labels,
                })
            }
            Ok(result) => Ok(TrialOutcome {
                trial_id: trial_id.to_string(),
                status: TrialStatus::Completed,
                result: Some(result),
                exit_code,
                failure: None,
                checkpoint_labels: summary.labels,
            }),
            Err(message) => {
                let failure = ErrorEnvelope::new(
                    "result_invalid",
                    message,
                    json!({ "trial_id": trial_id, "stderr_tail": stderr_tail }),
                );
                Ok(TrialOutcome::failed(trial_id, failure, exit_code, summary.labels))
            }
        }
    }

    /// Reads harness stdout to EOF, committing checkpoints and answering each
    /// one on stdin.
    fn pump_stdout(
        &self,
        trial: &Trial,
        gate: &TrialGate,
        store: &CheckpointStore,
        sink: &dyn TrialSink,
        stdout: Option<ChildStdout>,
        mut stdin: Option<ChildStdin>,
    ) -> ControlResult<StdoutSummary> {
        let mut summary = StdoutSummary::default();
        let Some(stdout) = stdout else {
            return Ok(summary);
        };
        let mut bindings = trial.bindings.clone();
        let environment = self.checkpoint_environment(trial);

        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(trial_id = %trial.trial_id, error = %e, "stdout read stopped");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(trimmed) else {
                continue;
            };
            if event.get("event_type").and_then(|v| v.as_str()) != Some("checkpoint") {
                if event.is_object() && event.get("event_type").is_none() {
                    summary.last_json = Some(trimmed.to_string());
                }
                continue;
            }

            let Some(label) = event.get("label").and_then(|v| v.as_str()).filter(|l| !l.is_empty())
            else {
                warn!(trial_id = %trial.trial_id, "checkpoint event without label ignored");
                send_reply(&mut stdin, &json!({"event_type": "control", "action": "continue"}));
                continue;
            };
            let mut state = CheckpointState::new(
                bindings.clone(),
                event.get("step").and_then(|v| v.as_u64()),
                event.get("state").cloned().unwrap_or(Value::Null),
            );
            state.environment = environment.clone();
            let checkpoint = store.append(&trial.trial_id, label, state.to_bytes()?)?;
            let reference = checkpoint.reference();
            sink.checkpoint_committed(&trial.trial_id, &reference)?;
            summary.labels.push(label.to_string());

            let directive = gate.checkpoint_reached(&reference, sink)?;
            let action = match &directive {
                Directive::Continue { bindings: Some(updated) } => {
                    bindings = updated.clone();
                    "continue"
                }
                Directive::Continue { bindings: None } => "continue",
                Directive::Stop => "stop",
            };
            send_reply(
                &mut stdin,
                &json!({
                    "event_type": "control",
                    "action": action,
                    "sequence_number": reference.sequence_number,
                    "bindings": bindings,
                }),
            );
            if directive == Directive::Stop {
                stdin = None;
            }
        }
        Ok(summary)
    }

    fn watch(
        &self,
        gate: &TrialGate,
        child: &Mutex<Child>,
        killed: &Mutex<Option<KillReason>>,
        deadline: Option<Instant>,
    ) {
        loop {
            match gate.has_process_exited() {
                Ok(false) => {}
                _ => return,
            }
            if let Ok(Some(reason)) = gate.kill_reason(self.timings.cancel_grace, deadline) {
                if let Ok(mut child) = child.lock() {
                    let _ = child.kill();
                }
                if let Ok(mut slot) = killed.lock() {
                    *slot = Some(reason);
                }
                warn!(trial_id = gate.trial_id(), reason = ?reason, "harness killed");
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn checkpoint_environment(&self, trial: &Trial) -> Map<String, Value> {
        let mut env = Map::new();
        env.insert("run_id".to_string(), json!(trial.run_id));
        env.insert("trial_id".to_string(), json!(trial.trial_id));
        env.insert("variant_id".to_string(), json!(trial.variant_id));
        env.insert("task_id".to_string(), json!(trial.task_id));
        env.insert("repl_idx".to_string(), json!(trial.repl_idx));
        env.insert(
            "sandbox".to_string(),
            json!(if self.is_container() { "container" } else { "local" }),
        );
        env
    }

    fn trial_input(&self, trial: &Trial, paths: &TrialHostPaths, resume: Option<&ResumeSeed>) -> Value {
        let container = self.is_container();
        let runtime_paths = if container {
            json!({
                "in": AGENTLAB_CONTRACT_IN_DIR,
                "out": AGENTLAB_CONTRACT_OUT_DIR,
                "state": AGENTLAB_CONTRACT_STATE_DIR,
                "workspace": AGENTLAB_CONTRACT_WORKSPACE_DIR,
            })
        } else {
            json!({
                "in": paths.in_dir.to_string_lossy(),
                "out": paths.out_dir.to_string_lossy(),
                "state": paths.state_dir.to_string_lossy(),
                "workspace": paths.workspace_dir.to_string_lossy(),
            })
        };
        let resume = resume.map(|seed| {
            json!({
                "source_trial_id": seed.source_trial_id,
                "label": seed.label,
                "sequence_number": seed.sequence_number,
                "step": seed.state.step,
                "state_path": self.resume_state_path(paths),
            })
        });
        json!({
            "schema_version": "trial_input_v1",
            "ids": {
                "run_id": trial.run_id,
                "trial_id": trial.trial_id,
                "variant_id": trial.variant_id,
                "task_id": trial.task_id,
                "repl_idx": trial.repl_idx,
            },
            "task": trial.task,
            "bindings": trial.bindings,
            "resume": resume,
            "runtime": {
                "sandbox": if container { "container" } else { "local" },
                "paths": runtime_paths,
                "control": { "mode": "stdio" },
            }
        })
    }

    fn resume_state_path(&self, paths: &TrialHostPaths) -> String {
        if self.is_container() {
            AGENTLAB_RESUME_STATE_PATH.to_string()
        } else {
            paths.resume_state.to_string_lossy().to_string()
        }
    }

    fn harness_env(&self, trial: &Trial, paths: &TrialHostPaths, resume: Option<&ResumeSeed>) -> Vec<(String, String)> {
        let (input, output) = if self.is_container() {
            (
                AGENTLAB_TRIAL_INPUT_PATH.to_string(),
                AGENTLAB_TRIAL_OUTPUT_PATH.to_string(),
            )
        } else {
            (
                paths.trial_input.to_string_lossy().to_string(),
                paths.trial_output.to_string_lossy().to_string(),
            )
        };
        let mut env: Vec<(String, String)> = self
            .harness
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push((AGENTLAB_ENV_TRIAL_INPUT.to_string(), input));
        env.push((AGENTLAB_ENV_TRIAL_OUTPUT.to_string(), output));
        env.push((AGENTLAB_ENV_RUN_ID.to_string(), trial.run_id.clone()));
        env.push((AGENTLAB_ENV_TRIAL_ID.to_string(), trial.trial_id.clone()));
        env.push((AGENTLAB_ENV_VARIANT_ID.to_string(), trial.variant_id.clone()));
        env.push((AGENTLAB_ENV_TASK_ID.to_string(), trial.task_id.clone()));
        env.push((AGENTLAB_ENV_REPL_IDX.to_string(), trial.repl_idx.to_string()));
        env.push((AGENTLAB_ENV_CONTROL_MODE.to_string(), "stdio".to_string()));
        if let Some(seed) = resume {
            env.push((AGENTLAB_ENV_RESUME_STATE.to_string(), self.resume_state_path(paths)));
            env.push((AGENTLAB_ENV_RESUME_LABEL.to_string(), seed.label.clone()));
        }
        env
    }

    fn command(&self, trial: &Trial, paths: &TrialHostPaths, resume: Option<&ResumeSeed>) -> ControlResult<Command> {
        if self.harness.command.is_empty() {
            return Err(ControlError::BadConfig(
                "/runtime/harness/command is empty".to_string(),
            ));
        }
        let env = self.harness_env(trial, paths, resume);
        match &self.sandbox {
            Sandbox::Local => {
                let parts = self.harness.local_command(&self.base_dir);
                let mut cmd = Command::new(&parts[0]);
                cmd.args(&parts[1..]);
                cmd.current_dir(&paths.workspace_dir);
                cmd.envs(env);
                Ok(cmd)
            }
            Sandbox::Container(spec) => {
                copy_dir_filtered(&self.base_dir, &paths.workspace_dir, WORKSPACE_EXCLUDES)?;
                let mut cmd = Command::new("docker");
                cmd.args(container_args(
                    spec,
                    paths,
                    &env,
                    &self.harness.container_command(&self.base_dir),
                ));
                Ok(cmd)
            }
        }
    }
}

/// `docker run` arguments for one trial. stdin stays attached for control
/// replies.
pub(crate) fn container_args(
    spec: &ContainerSpec,
    paths: &TrialHostPaths,
    env: &[(String, String)],
    command: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "-i".into(), "--rm".into()];
    if spec.root_read_only {
        args.push("--read-only".into());
    }
    if let Some(user) = &spec.run_as_user {
        args.push("-u".into());
        args.push(user.clone());
    }
    if spec.network_none {
        args.push("--network=none".into());
    }
    if spec.no_new_privileges {
        args.push("--security-opt".into());
        args.push("no-new-privileges".into());
    }
    if spec.drop_all_caps {
        args.push("--cap-drop".into());
        args.push("ALL".into());
    }
    if let Some(cpus) = spec.cpu_count {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(mem) = spec.memory_mb {
        args.push("--memory".into());
        args.push(format!("{}m", mem));
    }
    for (host, contract, mode) in [
        (&paths.in_dir, AGENTLAB_CONTRACT_IN_DIR, ":ro"),
        (&paths.out_dir, AGENTLAB_CONTRACT_OUT_DIR, ""),
        (&paths.state_dir, AGENTLAB_CONTRACT_STATE_DIR, ""),
        (&paths.workspace_dir, AGENTLAB_CONTRACT_WORKSPACE_DIR, ""),
    ] {
        args.push("-v".into());
        args.push(format!("{}:{}{}", host.display(), contract, mode));
    }
    args.push("--tmpfs".into());
    args.push("/tmp:rw".into());
    args.push("-w".into());
    args.push(AGENTLAB_CONTRACT_WORKSPACE_DIR.into());
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }
    args.push(spec.image.clone());
    args.extend(command.iter().cloned());
    args
}

fn send_reply(stdin: &mut Option<ChildStdin>, reply: &Value) {
    let Some(pipe) = stdin.as_mut() else {
        return;
    };
    let written = writeln!(pipe, "{}", reply).and_then(|_| pipe.flush());
    if let Err(e) = written {
        debug!(error = %e, "harness closed its control channel");
        *stdin = None;
    }
}

fn wait_for_exit(child: &Mutex<Child>) -> ControlResult<ExitStatus> {
    loop {
        {
            let mut child = child
                .lock()
                .map_err(|_| ControlError::Storage("child handle poisoned".to_string()))?;
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn collect_result(paths: &TrialHostPaths, last_json: Option<&str>) -> Result<TrialResult, String> {
    if !paths.trial_output.exists() {
        if let Some(line) = last_json {
            atomic_write_bytes(&paths.trial_output, line.as_bytes()).map_err(|e| format!("{:#}", e))?;
        }
    }
    if !paths.trial_output.exists() {
        return Err("harness exited without writing a result".to_string());
    }
    let value = load_json_file(&paths.trial_output).map_err(|e| format!("unparsable result: {:#}", e))?;
    lab_schemas::validate_value("trial_output_v1", &value)
        .map_err(|e| format!("result failed trial_output_v1: {:#}", e))?;
    serde_json::from_value(value).map_err(|e| format!("unparsable result: {}", e))
}

fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> ControlResult<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        match e.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => !exclude.iter().any(|ex| rel.starts_with(ex)),
            _ => true,
        }
    });
    for entry in walker {
        let entry = entry.map_err(|e| ControlError::Storage(e.to_string()))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            ensure_dir(&target)?;
        } else if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RunLedger;
    use crate::model::RunStatus;
    use crate::test_support::{sample_ledger, write_harness, TempDirGuard};
    use std::collections::BTreeMap;

    struct Fixture {
        dir: TempDirGuard,
        store: CheckpointStore,
        ledger: RunLedger,
        gate: Arc<TrialGate>,
    }

    fn fixture(prefix: &str) -> Fixture {
        let dir = TempDirGuard::new(prefix);
        let store = CheckpointStore::open(&dir.path.join("checkpoints")).expect("store");
        let ledger = sample_ledger(&dir.path, 1);
        ledger.begin_dispatch().expect("dispatch");
        Fixture {
            dir,
            store,
            ledger,
            gate: Arc::new(TrialGate::new("trial_001")),
        }
    }

    fn executor(fx: &Fixture, body: &str, timings: ControlTimings) -> TrialExecutor {
        let script = write_harness(&fx.dir.path, "harness.sh", body);
        TrialExecutor::new(
            HarnessSpec {
                command: vec!["sh".to_string(), script.to_string_lossy().to_string()],
                env: BTreeMap::new(),
            },
            Sandbox::Local,
            timings,
            &fx.dir.path,
        )
    }

    fn run(fx: &Fixture, exec: &TrialExecutor) -> TrialOutcome {
        exec.run(TrialJob {
            trial: fx.ledger.trial("trial_001").expect("trial"),
            trial_dir: fx.ledger.trial_dir("trial_001"),
            gate: fx.gate.clone(),
            store: &fx.store,
            sink: &fx.ledger,
            resume: None,
        })
        .expect("run")
        .expect("started")
    }

    #[test]
    fn successful_harness_completes_trial_and_run() {
        let fx = fixture("exec_success");
        let exec = executor(
            &fx,
            r#"printf '{"outcome":"success","metrics":{"score":1}}' > "$AGENTLAB_TRIAL_OUTPUT""#,
            ControlTimings::default(),
        );
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        let result = outcome.result.expect("result");
        assert_eq!(result.metrics.get("score"), Some(&json!(1)));
        assert_eq!(fx.ledger.status().expect("status"), RunStatus::Completed);
        let input = load_json_file(&fx.ledger.trial_dir("trial_001").join("in/trial_input.json"))
            .expect("input");
        assert_eq!(input["schema_version"], "trial_input_v1");
        assert_eq!(input["ids"]["trial_id"], "trial_001");
    }

    #[test]
    fn checkpoints_are_committed_in_order_and_stdout_result_promoted() {
        let fx = fixture("exec_checkpoints");
        let exec = executor(
            &fx,
            r#"echo '{"event_type":"checkpoint","label":"step_1","step":1,"state":{"n":1}}'
read reply
echo '{"event_type":"checkpoint","label":"step_2","step":2,"state":{"n":2}}'
read reply
case "$reply" in *'"continue"'*) ;; *) exit 9 ;; esac
echo '{"outcome":"success","output":"done"}'"#,
            ControlTimings::default(),
        );
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Completed, "{:?}", outcome.failure);
        assert_eq!(outcome.checkpoint_labels, vec!["step_1", "step_2"]);
        let stored = fx.store.list("trial_001").expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].sequence_number, 2);
        let state = stored[1].decode_state().expect("state");
        assert_eq!(state.step, Some(2));
        assert_eq!(state.harness_state, json!({"n": 2}));
        assert_eq!(state.environment["trial_id"], "trial_001");
        let trial = fx.ledger.trial("trial_001").expect("trial");
        assert_eq!(trial.checkpoint_labels(), vec!["step_1", "step_2"]);
        assert_eq!(outcome.result.expect("result").output, json!("done"));
    }

    #[test]
    fn nonzero_exit_fails_with_stderr_tail() {
        let fx = fixture("exec_crash");
        let exec = executor(&fx, "echo boom >&2\nexit 3", ControlTimings::default());
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.code, "trial_crashed");
        assert_eq!(failure.details["stderr_tail"], "boom");
        let log = fs::read_to_string(fx.ledger.trial_dir("trial_001").join("harness_stderr.log"))
            .expect("stderr log");
        assert!(log.contains("boom"));
        assert_eq!(fx.ledger.status().expect("status"), RunStatus::Failed);
    }

    #[test]
    fn unparsable_result_fails_trial() {
        let fx = fixture("exec_bad_result");
        let exec = executor(
            &fx,
            r#"echo 'not json' > "$AGENTLAB_TRIAL_OUTPUT""#,
            ControlTimings::default(),
        );
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Failed);
        assert_eq!(outcome.failure.expect("failure").code, "result_invalid");
    }

    #[test]
    fn spawn_failure_is_recorded() {
        let fx = fixture("exec_spawn");
        let exec = TrialExecutor::new(
            HarnessSpec {
                command: vec!["/nonexistent/agentlab_harness_bin".to_string()],
                env: BTreeMap::new(),
            },
            Sandbox::Local,
            ControlTimings::default(),
            &fx.dir.path,
        );
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Failed);
        assert_eq!(outcome.failure.expect("failure").code, "spawn_failed");
        assert_eq!(
            fx.ledger.trial("trial_001").expect("trial").status,
            TrialStatus::Failed
        );
    }

    #[test]
    fn cancelled_trial_receives_stop_at_next_checkpoint() {
        let fx = fixture("exec_cancel");
        let exec = executor(
            &fx,
            r#"echo '{"event_type":"checkpoint","label":"a","step":1,"state":{}}'
read reply
case "$reply" in *'"stop"'*) exit 0 ;; esac
echo '{"outcome":"success"}'"#,
            ControlTimings::default(),
        );
        fx.gate.request_cancel().expect("cancel");
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Cancelled);
        assert!(outcome.result.is_none());
    }

    #[test]
    fn cancelled_trial_ignoring_stop_is_killed_after_grace() {
        let fx = fixture("exec_grace");
        let exec = executor(
            &fx,
            r#"echo '{"event_type":"checkpoint","label":"a","step":1,"state":{}}'
read reply
exec sleep 30"#,
            ControlTimings {
                cancel_grace: Duration::from_millis(100),
                trial_timeout: None,
            },
        );
        fx.gate.request_cancel().expect("cancel");
        let started = Instant::now();
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn trial_timeout_kills_and_fails() {
        let fx = fixture("exec_timeout");
        let exec = executor(
            &fx,
            "exec sleep 30",
            ControlTimings {
                cancel_grace: Duration::from_millis(100),
                trial_timeout: Some(Duration::from_millis(200)),
            },
        );
        let outcome = run(&fx, &exec);
        assert_eq!(outcome.status, TrialStatus::Failed);
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.code, "trial_crashed");
        assert!(failure.message.contains("trial timeout"), "{}", failure.message);
    }

    #[test]
    fn container_args_harden_the_sandbox() {
        let paths = trial_host_paths(Path::new("/runs/r1/trials/trial_001"));
        let spec = ContainerSpec {
            image: "harness:1".to_string(),
            network_none: true,
            root_read_only: true,
            run_as_user: Some("1000:1000".to_string()),
            no_new_privileges: true,
            drop_all_caps: true,
            cpu_count: Some(2),
            memory_mb: Some(512),
        };
        let env = vec![("AGENTLAB_TRIAL_ID".to_string(), "trial_001".to_string())];
        let args = container_args(&spec, &paths, &env, &["node".to_string(), "h.js".to_string()]);
        let joined = args.join(" ");
        assert!(joined.starts_with("run -i --rm --read-only -u 1000:1000 --network=none"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("/runs/r1/trials/trial_001/in:/agentlab/in:ro"));
        assert!(joined.contains("-e AGENTLAB_TRIAL_ID=trial_001"));
        assert!(joined.ends_with("harness:1 node h.js"));
    }
}
