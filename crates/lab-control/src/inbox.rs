//! File-based command channel of a live run.
//!
//! A separate process drops `runtime/control/requests/<request_id>.json`; the
//! process dispatching the run answers with
//! `runtime/control/responses/<request_id>.json`. Each request is served on
//! its own thread so a blocking `pause` never holds up a `resume`.

use crate::controller::RunController;
use crate::error::{ControlError, ControlResult, ErrorEnvelope};
use crate::fork::{ForkRequest, ForkSelector};
use chrono::Utc;
use lab_core::{atomic_write_json_pretty, ensure_dir, load_json_file};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CONTROL_REQUEST_SCHEMA: &str = "control_request_v1";
pub const CONTROL_RESPONSE_SCHEMA: &str = "control_response_v1";
pub const DEFAULT_PAUSE_TIMEOUT_MS: u64 = 60_000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn default_pause_timeout_ms() -> u64 {
    DEFAULT_PAUSE_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    Pause {
        trial_id: String,
        label: String,
        #[serde(default = "default_pause_timeout_ms")]
        timeout_ms: u64,
    },
    Resume {
        trial_id: String,
        label: String,
        #[serde(default)]
        set: BTreeMap<String, Value>,
    },
    Fork {
        from_trial: String,
        at: String,
        #[serde(default)]
        set: BTreeMap<String, Value>,
        #[serde(default)]
        strict: bool,
    },
    Replay {
        trial_id: String,
        #[serde(default)]
        strict: bool,
    },
    Cancel,
}

impl ControlCommand {
    pub fn action(&self) -> &'static str {
        match self {
            ControlCommand::Pause { .. } => "pause",
            ControlCommand::Resume { .. } => "resume",
            ControlCommand::Fork { .. } => "fork",
            ControlCommand::Replay { .. } => "replay",
            ControlCommand::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub schema_version: String,
    pub request_id: String,
    #[serde(default)]
    pub requested_at: Option<String>,
    pub command: ControlCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub schema_version: String,
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    pub completed_at: String,
}

impl ControlResponse {
    pub fn from_result(request_id: &str, result: ControlResult<Value>) -> Self {
        let (ok, result, error) = match result {
            Ok(value) => (true, Some(value), None),
            Err(err) => (false, None, Some(err.envelope())),
        };
        Self {
            schema_version: CONTROL_RESPONSE_SCHEMA.to_string(),
            request_id: request_id.to_string(),
            ok,
            result,
            error,
            completed_at: Utc::now().to_rfc3339(),
        }
    }
}

pub fn requests_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("runtime").join("control").join("requests")
}

pub fn responses_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("runtime").join("control").join("responses")
}

pub fn parse_request(value: Value) -> ControlResult<ControlRequest> {
    lab_schemas::validate_value("control_request_v1.jsonschema", &value)
        .map_err(|e| ControlError::BadConfig(format!("control request: {:#}", e)))?;
    serde_json::from_value(value)
        .map_err(|e| ControlError::BadConfig(format!("control request: {}", e)))
}

/// Runs one command against `controller` and returns its JSON payload.
pub fn execute_command(controller: &RunController, command: &ControlCommand) -> ControlResult<Value> {
    let value = match command {
        ControlCommand::Pause {
            trial_id,
            label,
            timeout_ms,
        } => {
            let outcome = controller.pause(trial_id, label, Duration::from_millis(*timeout_ms))?;
            json!({
                "trial_id": outcome.trial_id,
                "paused": outcome.held,
                "held": outcome.held,
                "checkpoint": outcome.checkpoint,
            })
        }
        ControlCommand::Resume {
            trial_id,
            label,
            set,
        } => serde_json::to_value(controller.resume(trial_id, label, Some(set))?)?,
        ControlCommand::Fork {
            from_trial,
            at,
            set,
            strict,
        } => serde_json::to_value(controller.fork(&ForkRequest {
            from_trial: from_trial.clone(),
            at: ForkSelector::parse(at)?,
            overrides: set.clone(),
            strict: *strict,
        })?)?,
        ControlCommand::Replay { trial_id, strict } => {
            serde_json::to_value(controller.replay(trial_id, *strict)?)?
        }
        ControlCommand::Cancel => serde_json::to_value(controller.cancel()?)?,
    };
    Ok(value)
}

fn pending_requests(dir: &Path) -> ControlResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    if !dir.exists() {
        return Ok(paths);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        // atomic writes stage under a dot-prefixed name
        if name.starts_with('.') || path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

fn handle_request(controller: &RunController, path: &Path) -> ControlResult<()> {
    let fallback_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();
    let parsed = load_json_file(path)
        .map_err(ControlError::from)
        .and_then(parse_request);
    let response = match parsed {
        Ok(request) => {
            info!(
                request_id = %request.request_id,
                action = request.command.action(),
                "control request received"
            );
            let result = execute_command(controller, &request.command);
            if let Err(err) = &result {
                warn!(request_id = %request.request_id, code = err.code(), "control request failed: {}", err);
            }
            ControlResponse::from_result(&request.request_id, result)
        }
        Err(err) => {
            warn!(request = %path.display(), "rejected control request: {}", err);
            ControlResponse::from_result(&fallback_id, Err(err))
        }
    };
    let out = responses_dir(controller.run_dir()).join(format!("{}.json", response.request_id));
    atomic_write_json_pretty(&out, &serde_json::to_value(&response)?)?;
    let _ = fs::remove_file(path);
    Ok(())
}

/// Serves the inbox of `controller`'s run until the run is terminal or
/// `stop` is set. Returns the number of requests answered.
pub fn serve_control(controller: &RunController, stop: &AtomicBool) -> ControlResult<usize> {
    let requests = requests_dir(controller.run_dir());
    ensure_dir(&requests)?;
    ensure_dir(&responses_dir(controller.run_dir()))?;
    let mut seen = BTreeSet::new();
    thread::scope(|scope| -> ControlResult<()> {
        loop {
            for path in pending_requests(&requests)? {
                if !seen.insert(path.clone()) {
                    continue;
                }
                scope.spawn(move || {
                    if let Err(err) = handle_request(controller, &path) {
                        warn!(request = %path.display(), "control response not written: {}", err);
                    }
                });
            }
            if stop.load(Ordering::SeqCst) || controller.run()?.status.is_terminal() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    })?;
    debug!(served = seen.len(), "control inbox closed");
    Ok(seen.len())
}

/// Writes a request into the inbox of a live run and waits for its response.
pub fn submit_control(
    run_dir: &Path,
    command: ControlCommand,
    timeout: Duration,
) -> ControlResult<ControlResponse> {
    let request_id = format!(
        "req_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S_%6f"),
        std::process::id()
    );
    let request = ControlRequest {
        schema_version: CONTROL_REQUEST_SCHEMA.to_string(),
        request_id: request_id.clone(),
        requested_at: Some(Utc::now().to_rfc3339()),
        command,
    };
    let request_path = requests_dir(run_dir).join(format!("{}.json", request_id));
    atomic_write_json_pretty(&request_path, &serde_json::to_value(&request)?)?;
    debug!(request_id = %request_id, action = request.command.action(), "control request submitted");

    let response_path = responses_dir(run_dir).join(format!("{}.json", request_id));
    let deadline = Instant::now() + timeout;
    while !response_path.exists() {
        if Instant::now() >= deadline {
            let _ = fs::remove_file(&request_path);
            return Err(ControlError::Storage(format!(
                "control request {} not answered within {}ms",
                request_id,
                timeout.as_millis()
            )));
        }
        thread::sleep(POLL_INTERVAL);
    }
    let response: ControlResponse = serde_json::from_value(load_json_file(&response_path)?)?;
    let _ = fs::remove_file(&response_path);
    Ok(response)
}
