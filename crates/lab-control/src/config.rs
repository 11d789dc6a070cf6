use crate::error::{ControlError, ControlResult};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CANCEL_GRACE_MS: u64 = 10_000;

/// Loads an experiment file. YAML is a superset of JSON so both parse.
pub fn load_experiment(path: &Path) -> ControlResult<Value> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ControlError::BadConfig(format!("{}: {}", path.display(), e)))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| ControlError::BadConfig(format!("{}: {}", path.display(), e)))?;
    serde_json::to_value(yaml_value)
        .map_err(|e| ControlError::BadConfig(format!("{}: {}", path.display(), e)))
}

/// Walks up from the experiment directory to the directory holding `.lab`.
pub fn find_project_root(experiment_dir: &Path) -> PathBuf {
    let mut cur = Some(experiment_dir);
    while let Some(p) = cur {
        if p.join(".lab").is_dir() {
            return p.to_path_buf();
        }
        if p.file_name().and_then(|s| s.to_str()) == Some(".lab") {
            return p.parent().unwrap_or(experiment_dir).to_path_buf();
        }
        cur = p.parent();
    }
    experiment_dir.to_path_buf()
}

fn validate_required_fields(config: &Value) -> ControlResult<()> {
    let mut missing: Vec<&str> = Vec::new();
    for pointer in ["/experiment/id", "/runtime/harness/command"] {
        let is_missing = match config.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(pointer);
        }
    }
    if config.pointer("/dataset/tasks").is_none() && config.pointer("/dataset/path").is_none() {
        missing.push("/dataset/tasks or /dataset/path");
    }
    if config.pointer("/design/replications").and_then(|v| v.as_u64()) == Some(0) {
        missing.push("/design/replications (must be >= 1)");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ControlError::BadConfig(format!(
            "experiment missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    pub variant_id: String,
    pub bindings: Value,
}

fn resolve_variant_plan(config: &Value) -> ControlResult<Vec<Variant>> {
    let baseline = config
        .pointer("/baseline/variant_id")
        .and_then(|v| v.as_str())
        .unwrap_or("baseline")
        .to_string();
    let mut variants = vec![Variant {
        variant_id: baseline,
        bindings: config
            .pointer("/baseline/bindings")
            .cloned()
            .unwrap_or(json!({})),
    }];

    let variant_list = config
        .pointer("/variant_plan")
        .and_then(|v| v.as_array())
        .or_else(|| config.pointer("/variants").and_then(|v| v.as_array()));
    if let Some(list) = variant_list {
        for (idx, item) in list.iter().enumerate() {
            let variant_id = item
                .get("variant_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("variant_{}", idx + 1));
            let bindings = item.get("bindings").cloned().unwrap_or(json!({}));
            if !bindings.is_object() {
                return Err(ControlError::BadConfig(format!(
                    "variant {} bindings must be an object",
                    variant_id
                )));
            }
            variants.push(Variant {
                variant_id,
                bindings,
            });
        }
    }
    let mut seen = std::collections::BTreeSet::new();
    for v in &variants {
        if !seen.insert(v.variant_id.as_str()) {
            return Err(ControlError::BadConfig(format!(
                "duplicate variant_id: {}",
                v.variant_id
            )));
        }
    }
    Ok(variants)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub task: Value,
}

fn load_tasks(config: &Value, base_dir: &Path) -> ControlResult<Vec<TaskSpec>> {
    let raw: Vec<Value> = if let Some(inline) = config.pointer("/dataset/tasks") {
        inline
            .as_array()
            .cloned()
            .ok_or_else(|| ControlError::BadConfig("/dataset/tasks must be a list".to_string()))?
    } else {
        let rel = config
            .pointer("/dataset/path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ControlError::BadConfig("/dataset/path must be a string".to_string()))?;
        let path = base_dir.join(rel);
        let data = fs::read_to_string(&path)
            .map_err(|e| ControlError::BadConfig(format!("{}: {}", path.display(), e)))?;
        let mut tasks = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let task: Value = serde_json::from_str(line).map_err(|e| {
                ControlError::BadConfig(format!("{}:{}: {}", path.display(), line_no + 1, e))
            })?;
            tasks.push(task);
        }
        tasks
    };
    let limit = config
        .pointer("/dataset/limit")
        .and_then(|v| v.as_u64())
        .map(|l| l as usize)
        .unwrap_or(usize::MAX);
    Ok(raw
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(idx, task)| {
            let task_id = task
                .get("id")
                .or_else(|| task.get("task_id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("task_{}", idx));
            TaskSpec { task_id, task }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessSpec {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl HarnessSpec {
    /// Relative script paths resolve against the experiment directory.
    pub fn local_command(&self, base_dir: &Path) -> Vec<String> {
        self.command
            .iter()
            .map(|part| {
                let p = Path::new(part);
                if p.is_relative() && command_part_looks_like_path(part) {
                    normalize_path(&base_dir.join(p))
                        .to_string_lossy()
                        .to_string()
                } else {
                    part.clone()
                }
            })
            .collect()
    }

    /// Relative script paths resolve inside the mounted workspace.
    pub fn container_command(&self, base_dir: &Path) -> Vec<String> {
        self.command
            .iter()
            .map(|part| {
                let p = Path::new(part);
                if p.is_relative() && command_part_looks_like_path(part) {
                    let rel = part.trim_start_matches("./");
                    format!("{}/{}", lab_core::AGENTLAB_CONTRACT_WORKSPACE_DIR, rel)
                } else if let Ok(rel) = p.strip_prefix(base_dir) {
                    format!(
                        "{}/{}",
                        lab_core::AGENTLAB_CONTRACT_WORKSPACE_DIR,
                        rel.to_string_lossy().trim_start_matches('/')
                    )
                } else {
                    part.clone()
                }
            })
            .collect()
    }
}

fn command_part_looks_like_path(part: &str) -> bool {
    if part.is_empty() || part.starts_with('-') || part.contains(char::is_whitespace) {
        return false;
    }
    part.starts_with('.')
        || part.starts_with('/')
        || part.contains('/')
        || part.ends_with(".js")
        || part.ends_with(".mjs")
        || part.ends_with(".ts")
        || part.ends_with(".py")
        || part.ends_with(".sh")
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSpec {
    pub image: String,
    pub network_none: bool,
    pub root_read_only: bool,
    pub run_as_user: Option<String>,
    pub no_new_privileges: bool,
    pub drop_all_caps: bool,
    pub cpu_count: Option<u64>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Sandbox {
    Local,
    Container(ContainerSpec),
}

fn resolve_sandbox(config: &Value) -> ControlResult<Sandbox> {
    let mode = config
        .pointer("/runtime/sandbox/mode")
        .and_then(|v| v.as_str())
        .unwrap_or("local");
    match mode {
        "local" => Ok(Sandbox::Local),
        "container" => {
            let image = config
                .pointer("/runtime/sandbox/image")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ControlError::BadConfig(
                        "/runtime/sandbox/image required for container mode".to_string(),
                    )
                })?;
            let flag = |ptr: &str, default: bool| {
                config.pointer(ptr).and_then(|v| v.as_bool()).unwrap_or(default)
            };
            let network_mode = config
                .pointer("/runtime/network/mode")
                .and_then(|v| v.as_str())
                .unwrap_or("none");
            if network_mode != "none" && network_mode != "full" {
                return Err(ControlError::BadConfig(format!(
                    "unsupported /runtime/network/mode: {}",
                    network_mode
                )));
            }
            Ok(Sandbox::Container(ContainerSpec {
                image: image.to_string(),
                network_none: network_mode == "none",
                root_read_only: flag("/runtime/sandbox/root_read_only", true),
                run_as_user: config
                    .pointer("/runtime/sandbox/run_as_user")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                no_new_privileges: flag("/runtime/sandbox/hardening/no_new_privileges", true),
                drop_all_caps: flag("/runtime/sandbox/hardening/drop_all_caps", true),
                cpu_count: config
                    .pointer("/runtime/sandbox/resources/cpu_count")
                    .and_then(|v| v.as_u64()),
                memory_mb: config
                    .pointer("/runtime/sandbox/resources/memory_mb")
                    .and_then(|v| v.as_u64()),
            }))
        }
        other => Err(ControlError::BadConfig(format!(
            "unknown /runtime/sandbox/mode: {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlTimings {
    pub cancel_grace: Duration,
    pub trial_timeout: Option<Duration>,
}

impl Default for ControlTimings {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
            trial_timeout: None,
        }
    }
}

/// One cell of the trial matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixCell {
    pub schedule_index: usize,
    pub trial_id: String,
    pub task: TaskSpec,
    pub variant: Variant,
    pub repl_idx: usize,
}

/// Typed view of a resolved experiment configuration.
#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    pub experiment_id: String,
    pub base_dir: PathBuf,
    pub tasks: Vec<TaskSpec>,
    pub variants: Vec<Variant>,
    pub replications: usize,
    pub max_concurrency: usize,
    pub harness: HarnessSpec,
    pub sandbox: Sandbox,
    pub timings: ControlTimings,
}

impl ExperimentPlan {
    pub fn from_resolved(config: &Value, base_dir: &Path) -> ControlResult<Self> {
        validate_required_fields(config)?;
        let tasks = load_tasks(config, base_dir)?;
        Self::build(config, base_dir, tasks)
    }

    /// Rebuilds the plan of an existing run. Tasks come from the trial
    /// records, so a dataset file that changed or moved since scheduling is
    /// never re-read.
    pub fn for_existing_run(config: &Value, base_dir: &Path, tasks: Vec<TaskSpec>) -> ControlResult<Self> {
        validate_required_fields(config)?;
        Self::build(config, base_dir, tasks)
    }

    fn build(config: &Value, base_dir: &Path, tasks: Vec<TaskSpec>) -> ControlResult<Self> {
        let experiment_id = config
            .pointer("/experiment/id")
            .and_then(|v| v.as_str())
            .unwrap_or("exp")
            .to_string();
        let command = config
            .pointer("/runtime/harness/command")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                ControlError::BadConfig("/runtime/harness/command must be a list".to_string())
            })?
            .iter()
            .map(|v| {
                v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    ControlError::BadConfig(
                        "/runtime/harness/command entries must be strings".to_string(),
                    )
                })
            })
            .collect::<ControlResult<Vec<_>>>()?;
        let env = config
            .pointer("/runtime/harness/env")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        if tasks.is_empty() {
            return Err(ControlError::BadConfig("dataset contains no tasks".to_string()));
        }
        let replications = config
            .pointer("/design/replications")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as usize;
        let max_concurrency = match config.pointer("/design/max_concurrency") {
            None => 1,
            Some(v) => match v.as_u64() {
                Some(n) if n >= 1 => n as usize,
                _ => {
                    return Err(ControlError::BadConfig(
                        "/design/max_concurrency must be a positive integer".to_string(),
                    ))
                }
            },
        };
        let millis = |ptr: &str| config.pointer(ptr).and_then(|v| v.as_u64());
        let timings = ControlTimings {
            cancel_grace: Duration::from_millis(
                millis("/runtime/control/cancel_grace_ms").unwrap_or(DEFAULT_CANCEL_GRACE_MS),
            ),
            trial_timeout: millis("/runtime/control/trial_timeout_ms").map(Duration::from_millis),
        };

        Ok(Self {
            experiment_id,
            base_dir: base_dir.to_path_buf(),
            tasks,
            variants: resolve_variant_plan(config)?,
            replications,
            max_concurrency,
            harness: HarnessSpec { command, env },
            sandbox: resolve_sandbox(config)?,
            timings,
        })
    }

    /// Task-major, then variant, then replication. Trial ids follow the
    /// schedule index so the listing order is also the dispatch order.
    pub fn trial_matrix(&self) -> Vec<MatrixCell> {
        let mut cells = Vec::new();
        for task in &self.tasks {
            for variant in &self.variants {
                for repl_idx in 0..self.replications {
                    let schedule_index = cells.len();
                    cells.push(MatrixCell {
                        schedule_index,
                        trial_id: format!("trial_{:03}", schedule_index + 1),
                        task: task.clone(),
                        variant: variant.clone(),
                        repl_idx,
                    });
                }
            }
        }
        cells
    }

    pub fn summary(&self) -> Value {
        json!({
            "experiment_id": self.experiment_id,
            "base_dir": self.base_dir.display().to_string(),
            "task_count": self.tasks.len(),
            "variant_count": self.variants.len(),
            "variants": self.variants.iter().map(|v| v.variant_id.clone()).collect::<Vec<_>>(),
            "replications": self.replications,
            "total_trials": self.tasks.len() * self.variants.len() * self.replications,
            "max_concurrency": self.max_concurrency,
            "harness_command": self.harness.command,
            "sandbox": self.sandbox,
            "cancel_grace_ms": self.timings.cancel_grace.as_millis() as u64,
            "trial_timeout_ms": self.timings.trial_timeout.map(|d| d.as_millis() as u64),
        })
    }
}
