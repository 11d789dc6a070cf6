use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use lab_control::inbox::DEFAULT_PAUSE_TIMEOUT_MS;
use lab_control::{
    apply_overrides_file, execute_command, find_project_root, load_experiment,
    operation_lock_path, serve_control, submit_control, ControlCommand, ControlError,
    ExperimentPlan, KnobEngine, KnobOverrides, RunController, RunLedger, RunSummary,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lab", version, about = "AgentLab trial control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule and dispatch every trial of an experiment.
    Run {
        experiment: PathBuf,
        #[arg(long)]
        overrides: Option<PathBuf>,
        /// Defaults to `<project root>/.lab/runs`.
        #[arg(long)]
        runs_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        overrides: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Pause {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        trial_id: String,
        #[arg(long)]
        label: String,
        #[arg(long, default_value_t = DEFAULT_PAUSE_TIMEOUT_MS / 1000)]
        timeout_seconds: u64,
        #[arg(long)]
        json: bool,
    },
    Resume {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        trial_id: String,
        #[arg(long)]
        label: String,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Fork {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        from_trial: String,
        /// checkpoint:<label> | step:<n> | seq:<n>
        #[arg(long)]
        at: String,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        strict: bool,
        #[arg(long, default_value_t = 3600)]
        wait_seconds: u64,
        #[arg(long)]
        json: bool,
    },
    Replay {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        trial_id: String,
        #[arg(long)]
        strict: bool,
        #[arg(long, default_value_t = 3600)]
        wait_seconds: u64,
        #[arg(long)]
        json: bool,
    },
    Cancel {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    KnobsInit {
        #[arg(long, default_value = ".lab/knobs/manifest.json")]
        manifest: PathBuf,
        #[arg(long, default_value = ".lab/knobs/overrides.json")]
        overrides: PathBuf,
        #[arg(long)]
        force: bool,
    },
    KnobsValidate {
        #[arg(long, default_value = ".lab/knobs/manifest.json")]
        manifest: PathBuf,
        #[arg(long, default_value = ".lab/knobs/overrides.json")]
        overrides: PathBuf,
        #[arg(long)]
        json: bool,
    },
    SchemaValidate {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_to_json(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            overrides,
            runs_dir,
            json,
        } => {
            let (resolved, knobs, exp_dir, project_root) =
                resolve_experiment(&experiment, overrides.as_deref())?;
            let runs_root = runs_dir.unwrap_or_else(|| project_root.join(".lab").join("runs"));
            let controller = RunController::schedule(&runs_root, resolved, knobs, &exp_dir)?;
            let run_id = controller.run()?.run_id;
            info!(run_id = %run_id, run_dir = %controller.run_dir().display(), "run started");

            let stop = AtomicBool::new(false);
            let summary = thread::scope(|scope| {
                let server = scope.spawn(|| serve_control(&controller, &stop));
                let summary = controller.dispatch();
                stop.store(true, Ordering::SeqCst);
                match server.join() {
                    Ok(Ok(served)) => info!(run_id = %run_id, served, "control inbox closed"),
                    Ok(Err(err)) => warn!(run_id = %run_id, "control inbox failed: {}", err),
                    Err(_) => warn!(run_id = %run_id, "control inbox thread panicked"),
                }
                summary
            })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": controller.plan().summary(),
                    "run": summary,
                })));
            }
            print_run_summary(&summary);
        }
        Commands::Describe {
            experiment,
            overrides,
            json,
        } => {
            let (resolved, _, exp_dir, _) = resolve_experiment(&experiment, overrides.as_deref())?;
            let plan = ExperimentPlan::from_resolved(&resolved, &exp_dir)?;
            let summary = plan.summary();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                })));
            }
            print_plan(&plan);
        }
        Commands::Status { run_dir, json } => {
            let ledger = RunLedger::load(&run_dir)?;
            let run = ledger.run()?;
            let trials = ledger.trials()?;
            let live = operation_lock_path(&run_dir).exists();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "live": live,
                    "run": run,
                    "trials": trials.iter().map(|t| json!({
                        "trial_id": t.trial_id,
                        "status": t.status,
                        "variant_id": t.variant_id,
                        "task_id": t.task_id,
                        "checkpoints": t.checkpoint_labels(),
                        "failure": t.failure,
                    })).collect::<Vec<_>>(),
                })));
            }
            println!("run_id: {}", run.run_id);
            println!("status: {}", run.status);
            println!("live: {}", live);
            println!(
                "trials: {} (completed {}, failed {}, cancelled {}, running {}, paused {}, pending {})",
                run.counters.total,
                run.counters.completed,
                run.counters.failed,
                run.counters.cancelled,
                run.counters.running,
                run.counters.paused,
                run.counters.pending
            );
            for trial in &trials {
                println!("  {} {} {}/{}", trial.trial_id, trial.status, trial.variant_id, trial.task_id);
            }
        }
        Commands::Pause {
            run_dir,
            trial_id,
            label,
            timeout_seconds,
            json,
        } => {
            let command = ControlCommand::Pause {
                trial_id,
                label,
                timeout_ms: timeout_seconds * 1000,
            };
            let wait = Duration::from_secs(timeout_seconds + 30);
            let result = send_control(&run_dir, command, wait, false)?;
            if json {
                return Ok(Some(command_json("pause", result)));
            }
            println!("trial_id: {}", result["trial_id"].as_str().unwrap_or_default());
            println!("label: {}", result["checkpoint"]["label"].as_str().unwrap_or_default());
            println!("sequence_number: {}", result["checkpoint"]["sequence_number"]);
            println!("held: {}", result["held"]);
            if result["held"] != json!(true) {
                println!("note: label already passed; the trial kept running and cannot be resumed");
            }
        }
        Commands::Resume {
            run_dir,
            trial_id,
            label,
            set_values,
            json,
        } => {
            let command = ControlCommand::Resume {
                trial_id,
                label,
                set: parse_set_bindings(&set_values)?,
            };
            let result = send_control(&run_dir, command, Duration::from_secs(60), false)?;
            if json {
                return Ok(Some(command_json("resume", result)));
            }
            println!("trial_id: {}", result["trial_id"].as_str().unwrap_or_default());
            println!("label: {}", result["label"].as_str().unwrap_or_default());
            println!("bindings: {}", result["bindings"]);
        }
        Commands::Fork {
            run_dir,
            from_trial,
            at,
            set_values,
            strict,
            wait_seconds,
            json,
        } => {
            let command = ControlCommand::Fork {
                from_trial,
                at,
                set: parse_set_bindings(&set_values)?,
                strict,
            };
            let result = send_control(&run_dir, command, Duration::from_secs(wait_seconds), true)?;
            if json {
                return Ok(Some(command_json("fork", result)));
            }
            for key in ["fork_id", "trial_id", "parent_trial_id", "selector", "status"] {
                println!("{}: {}", key, result[key].as_str().unwrap_or_default());
            }
            println!("strict: {}", result["strict"]);
            println!(
                "source_checkpoint: {}",
                result["source_checkpoint"]["label"].as_str().unwrap_or("none")
            );
            if let Some(warnings) = result["warnings"].as_array().filter(|w| !w.is_empty()) {
                println!("warnings: {}", warnings.len());
            }
        }
        Commands::Replay {
            run_dir,
            trial_id,
            strict,
            wait_seconds,
            json,
        } => {
            let command = ControlCommand::Replay { trial_id, strict };
            let result = send_control(&run_dir, command, Duration::from_secs(wait_seconds), true)?;
            if json {
                return Ok(Some(command_json("replay", result)));
            }
            for key in ["replay_id", "trial_id", "replay_trial_id", "status"] {
                println!("{}: {}", key, result[key].as_str().unwrap_or_default());
            }
            println!("strict: {}", result["strict"]);
            println!("matched: {}", result["matched"]);
            if let Some(diffs) = result["diffs"].as_array() {
                for diff in diffs {
                    println!("  diff {}: {} != {}", diff["field"], diff["expected"], diff["found"]);
                }
            }
        }
        Commands::Cancel { run_dir, json } => {
            let result =
                send_control(&run_dir, ControlCommand::Cancel, Duration::from_secs(60), true)?;
            if json {
                return Ok(Some(command_json("cancel", result)));
            }
            println!("run_id: {}", result["run_id"].as_str().unwrap_or_default());
            println!("status: {}", result["status"].as_str().unwrap_or_default());
        }
        Commands::KnobsInit {
            manifest,
            overrides,
            force,
        } => {
            write_knob_files(&manifest, &overrides, force)?;
            println!("wrote: {}", manifest.display());
            println!("wrote: {}", overrides.display());
            println!(
                "next: lab knobs-validate --manifest {} --overrides {}",
                manifest.display(),
                overrides.display()
            );
        }
        Commands::KnobsValidate {
            manifest,
            overrides,
            json,
        } => {
            let engine = KnobEngine::load(&manifest)?;
            let document = KnobOverrides::load(&overrides)?;
            engine.validate(&document).into_result()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "knobs-validate",
                    "valid": true,
                    "manifest": manifest.display().to_string(),
                    "overrides": overrides.display().to_string()
                })));
            }
            println!("ok");
        }
        Commands::SchemaValidate { schema, file, json } => {
            let value = lab_core::load_json_file(&file)?;
            lab_schemas::validate_value(&schema, &value)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "schema-validate",
                    "valid": true,
                    "schema": schema
                })));
            }
            println!("ok");
        }
    }
    Ok(None)
}

/// Loads an experiment file and applies an overrides document. Without one,
/// the project's default knob manifest (if any) still guards later overrides.
fn resolve_experiment(
    experiment: &Path,
    overrides: Option<&Path>,
) -> Result<(Value, KnobEngine, PathBuf, PathBuf)> {
    let exp_dir = experiment
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()?;
    let project_root = find_project_root(&exp_dir);
    let config = load_experiment(experiment)?;
    let (resolved, knobs) = match overrides {
        Some(path) => apply_overrides_file(&config, path, &project_root)?,
        None => {
            let default_manifest = project_root.join(lab_control::knobs::DEFAULT_MANIFEST_PATH);
            let knobs = if default_manifest.exists() {
                KnobEngine::load(&default_manifest)?
            } else {
                KnobEngine::empty()
            };
            (config, knobs)
        }
    };
    Ok((resolved, knobs, exp_dir, project_root))
}

/// Routes a control command to the live process that owns `run_dir`, or runs
/// it here after taking the run operation lock.
fn send_control(
    run_dir: &Path,
    command: ControlCommand,
    wait: Duration,
    allow_offline: bool,
) -> Result<Value> {
    if operation_lock_path(run_dir).exists() {
        let response = submit_control(run_dir, command, wait)?;
        return match (response.ok, response.result, response.error) {
            (true, Some(result), _) => Ok(result),
            (_, _, Some(envelope)) => Err(anyhow::Error::new(CommandFailed(envelope))),
            _ => Err(anyhow!("control response {} carried no payload", response.request_id)),
        };
    }
    if !allow_offline {
        return Err(anyhow!(
            "{} needs a live run; no control process owns {}",
            command.action(),
            run_dir.display()
        ));
    }
    let controller = RunController::open(run_dir)?;
    Ok(execute_command(&controller, &command)?)
}

/// Error envelope relayed from the live control process.
#[derive(Debug)]
struct CommandFailed(lab_control::ErrorEnvelope);

impl std::fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.0.code, self.0.message)
    }
}

impl std::error::Error for CommandFailed {}

fn command_json(command: &str, result: Value) -> Value {
    let mut payload = json!({ "ok": true, "command": command });
    payload[command] = result;
    payload
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_to_json(err: &anyhow::Error) -> Value {
    if let Some(control) = err.downcast_ref::<ControlError>() {
        return json_error(control.code(), control.to_string(), control.details());
    }
    if let Some(CommandFailed(envelope)) = err.downcast_ref::<CommandFailed>() {
        return json_error(&envelope.code, envelope.message.clone(), envelope.details.clone());
    }
    json_error("command_failed", format!("{:#}", err), json!({}))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Status { json, .. }
        | Commands::Pause { json, .. }
        | Commands::Resume { json, .. }
        | Commands::Fork { json, .. }
        | Commands::Replay { json, .. }
        | Commands::Cancel { json, .. }
        | Commands::KnobsValidate { json, .. }
        | Commands::SchemaValidate { json, .. } => *json,
        Commands::KnobsInit { .. } => false,
    }
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.trim().to_string(), parsed);
    }
    Ok(out)
}

fn print_plan(plan: &ExperimentPlan) {
    println!("experiment: {}", plan.experiment_id);
    println!("base_dir: {}", plan.base_dir.display());
    println!("tasks: {}", plan.tasks.len());
    println!(
        "variants: {}",
        plan.variants
            .iter()
            .map(|v| v.variant_id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("replications: {}", plan.replications);
    println!("total_trials: {}", plan.trial_matrix().len());
    println!("max_concurrency: {}", plan.max_concurrency);
    println!("harness: {:?}", plan.harness.command);
    println!("cancel_grace_ms: {}", plan.timings.cancel_grace.as_millis());
    if let Some(timeout) = plan.timings.trial_timeout {
        println!("trial_timeout_ms: {}", timeout.as_millis());
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!("run_id: {}", summary.run_id);
    println!("run_dir: {}", summary.run_dir.display());
    println!("status: {}", summary.status);
    println!(
        "trials: {} (completed {}, failed {}, cancelled {})",
        summary.counters.total,
        summary.counters.completed,
        summary.counters.failed,
        summary.counters.cancelled
    );
    println!("peak_running: {}", summary.peak_running);
    for trial in &summary.trials {
        let detail = trial
            .failure_code
            .clone()
            .or_else(|| trial.outcome.clone())
            .unwrap_or_default();
        println!("  {} {} {}", trial.trial_id, trial.status, detail);
    }
}

fn write_knob_files(manifest: &Path, overrides: &Path, force: bool) -> Result<()> {
    if let Some(parent) = manifest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(parent) = overrides.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if force || !manifest.exists() {
        let manifest_template = r#"{
  "schema_version": "knob_manifest_v1",
  "knobs": [
    {
      "id": "design.replications",
      "label": "Replications",
      "json_pointer": "/design/replications",
      "type": "integer",
      "minimum": 1,
      "maximum": 100,
      "role": "core",
      "scientific_role": "control"
    },
    {
      "id": "design.max_concurrency",
      "label": "Max Concurrency",
      "json_pointer": "/design/max_concurrency",
      "type": "integer",
      "minimum": 1,
      "role": "infra",
      "scientific_role": "invariant"
    },
    {
      "id": "model",
      "label": "Model",
      "json_pointer": "/baseline/bindings/model",
      "type": "string",
      "role": "core",
      "scientific_role": "treatment"
    },
    {
      "id": "temperature",
      "label": "Temperature",
      "json_pointer": "/baseline/bindings/temperature",
      "type": "number",
      "minimum": 0,
      "maximum": 2,
      "role": "core",
      "scientific_role": "treatment"
    },
    {
      "id": "runtime.network.mode",
      "label": "Network Mode",
      "json_pointer": "/runtime/network/mode",
      "type": "enum",
      "options": ["none", "full"],
      "role": "infra",
      "scientific_role": "invariant"
    }
  ]
}
"#;
        std::fs::write(manifest, manifest_template)?;
    }

    if force || !overrides.exists() {
        let manifest_rel = if manifest.is_absolute() {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| manifest.strip_prefix(&cwd).ok().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| manifest.to_path_buf())
        } else {
            manifest.to_path_buf()
        };
        let document = json!({
            "schema_version": "experiment_overrides_v1",
            "manifest_path": manifest_rel.to_string_lossy(),
            "values": { "design.replications": 1 }
        });
        std::fs::write(overrides, format!("{}\n", serde_json::to_string_pretty(&document)?))?;
    }

    Ok(())
}
