use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const AGENTLAB_CONTRACT_IN_DIR: &str = "/agentlab/in";
pub const AGENTLAB_CONTRACT_OUT_DIR: &str = "/agentlab/out";
pub const AGENTLAB_CONTRACT_STATE_DIR: &str = "/agentlab/state";
pub const AGENTLAB_CONTRACT_WORKSPACE_DIR: &str = "/agentlab/workspace";

pub const AGENTLAB_TRIAL_INPUT_PATH: &str = "/agentlab/in/trial_input.json";
pub const AGENTLAB_TRIAL_OUTPUT_PATH: &str = "/agentlab/out/trial_output.json";
pub const AGENTLAB_RESUME_STATE_PATH: &str = "/agentlab/state/resume_state.json";

pub const AGENTLAB_ENV_TRIAL_INPUT: &str = "AGENTLAB_TRIAL_INPUT";
pub const AGENTLAB_ENV_TRIAL_OUTPUT: &str = "AGENTLAB_TRIAL_OUTPUT";
pub const AGENTLAB_ENV_RESUME_STATE: &str = "AGENTLAB_RESUME_STATE";
pub const AGENTLAB_ENV_RESUME_LABEL: &str = "AGENTLAB_RESUME_LABEL";
pub const AGENTLAB_ENV_CONTROL_MODE: &str = "AGENTLAB_CONTROL_MODE";
pub const AGENTLAB_ENV_RUN_ID: &str = "AGENTLAB_RUN_ID";
pub const AGENTLAB_ENV_TRIAL_ID: &str = "AGENTLAB_TRIAL_ID";
pub const AGENTLAB_ENV_VARIANT_ID: &str = "AGENTLAB_VARIANT_ID";
pub const AGENTLAB_ENV_TASK_ID: &str = "AGENTLAB_TASK_ID";
pub const AGENTLAB_ENV_REPL_IDX: &str = "AGENTLAB_REPL_IDX";

/// Host-side layout of one trial directory. The container sandbox mounts
/// `in`, `out`, `state` and `workspace` at the `/agentlab/*` contract paths.
#[derive(Debug, Clone)]
pub struct TrialHostPaths {
    pub trial_dir: PathBuf,
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    pub state_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub trial_input: PathBuf,
    pub trial_output: PathBuf,
    pub resume_state: PathBuf,
    pub trial_record: PathBuf,
    pub stderr_log: PathBuf,
}

pub fn trial_host_paths(trial_dir: &Path) -> TrialHostPaths {
    let in_dir = trial_dir.join("in");
    let out_dir = trial_dir.join("out");
    let state_dir = trial_dir.join("state");
    TrialHostPaths {
        trial_dir: trial_dir.to_path_buf(),
        workspace_dir: trial_dir.join("workspace"),
        trial_input: in_dir.join("trial_input.json"),
        trial_output: out_dir.join("trial_output.json"),
        resume_state: state_dir.join("resume_state.json"),
        trial_record: trial_dir.join("trial_state.json"),
        stderr_log: trial_dir.join("harness_stderr.log"),
        in_dir,
        out_dir,
        state_dir,
    }
}

impl TrialHostPaths {
    pub fn prepare(&self) -> Result<()> {
        ensure_dir(&self.in_dir)?;
        ensure_dir(&self.out_dir)?;
        ensure_dir(&self.state_dir)?;
        ensure_dir(&self.workspace_dir)?;
        Ok(())
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Serializes with object keys sorted so equal documents hash equally.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_json_string(s),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", quote_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn quote_json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file, fsyncs, then renames over `path`, so
/// readers observe either the old or the new contents and never a torn write.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn load_json_file(path: &Path) -> Result<Value> {
    let bytes =
        fs::read(path).map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Last `max_lines` non-empty lines of `text`, oldest first.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let mut lines: Vec<&str> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(max_lines)
        .collect();
    lines.reverse();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        let b = json!({"a": {"c": "x", "d": [1, 2]}, "b": 1});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
    }

    #[test]
    fn sha256_bytes_is_prefixed_hex() {
        let digest = sha256_bytes(b"abc");
        assert_eq!(
            digest,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn atomic_write_replaces_contents_without_leaving_temp_files() {
        let dir = temp_dir("lab_core_atomic");
        let path = dir.join("nested").join("record.json");
        atomic_write_json_pretty(&path, &json!({"status": "pending"})).expect("first write");
        atomic_write_json_pretty(&path, &json!({"status": "running"})).expect("second write");

        let value = load_json_file(&path).expect("read back");
        assert_eq!(value["status"], "running");
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn tail_lines_keeps_last_non_empty_lines_in_order() {
        let text = "one\n\ntwo\nthree\n\n";
        assert_eq!(tail_lines(text, 2), "two\nthree");
        assert_eq!(tail_lines("", 5), "");
    }

    #[test]
    fn trial_host_paths_follow_contract_layout() {
        let paths = trial_host_paths(Path::new("/runs/r1/trials/trial_001"));
        assert_eq!(
            paths.trial_input,
            PathBuf::from("/runs/r1/trials/trial_001/in/trial_input.json")
        );
        assert_eq!(
            paths.trial_output,
            PathBuf::from("/runs/r1/trials/trial_001/out/trial_output.json")
        );
        assert_eq!(
            paths.resume_state,
            PathBuf::from("/runs/r1/trials/trial_001/state/resume_state.json")
        );
    }
}
