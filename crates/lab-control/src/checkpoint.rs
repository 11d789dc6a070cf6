//! Immutable per-trial checkpoint records.
//!
//! Each checkpoint is one `checkpoint_v1` JSON envelope at
//! `<root>/<trial_id>/<sequence:06>.json`. The state blob is opaque to the
//! store; it is base64-encoded with a sha256 digest that is verified on load.

use crate::error::{ControlError, ControlResult};
use crate::model::CheckpointRef;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use lab_core::{atomic_write_bytes, ensure_dir, sha256_bytes};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

pub const CHECKPOINT_SCHEMA: &str = "checkpoint_v1";
pub const CHECKPOINT_STATE_SCHEMA: &str = "checkpoint_state_v1";

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub trial_id: String,
    pub label: String,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
    pub state: Vec<u8>,
}

impl Checkpoint {
    pub fn reference(&self) -> CheckpointRef {
        CheckpointRef {
            sequence_number: self.sequence_number,
            label: self.label.clone(),
            created_at: self.created_at,
        }
    }

    pub fn decode_state(&self) -> ControlResult<CheckpointState> {
        CheckpointState::from_bytes(&self.state)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    schema_version: String,
    trial_id: String,
    label: String,
    sequence_number: u64,
    created_at: DateTime<Utc>,
    #[serde(default = "default_encoding")]
    state_encoding: String,
    #[serde(default)]
    state_digest: Option<String>,
    state: Value,
}

fn default_encoding() -> String {
    "base64".to_string()
}

impl CheckpointRecord {
    fn encode(checkpoint: &Checkpoint) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA.to_string(),
            trial_id: checkpoint.trial_id.clone(),
            label: checkpoint.label.clone(),
            sequence_number: checkpoint.sequence_number,
            created_at: checkpoint.created_at,
            state_encoding: "base64".to_string(),
            state_digest: Some(sha256_bytes(&checkpoint.state)),
            state: Value::String(BASE64.encode(&checkpoint.state)),
        }
    }

    fn decode(self, path: &Path) -> ControlResult<Checkpoint> {
        if !self.schema_version.starts_with("checkpoint_v") {
            return Err(ControlError::Storage(format!(
                "{}: unsupported checkpoint schema_version {}",
                path.display(),
                self.schema_version
            )));
        }
        let state = match (self.state_encoding.as_str(), &self.state) {
            ("base64", Value::String(encoded)) => BASE64.decode(encoded).map_err(|e| {
                ControlError::Storage(format!("{}: invalid base64 state: {}", path.display(), e))
            })?,
            // early writers stored the state document inline
            ("json", inline) => serde_json::to_vec(inline)?,
            (encoding, _) => {
                return Err(ControlError::Storage(format!(
                    "{}: unsupported state encoding {}",
                    path.display(),
                    encoding
                )))
            }
        };
        if let Some(expected) = self.state_digest.as_deref() {
            let actual = sha256_bytes(&state);
            if actual != expected {
                return Err(ControlError::Storage(format!(
                    "{}: state digest mismatch (expected {}, found {})",
                    path.display(),
                    expected,
                    actual
                )));
            }
        }
        Ok(Checkpoint {
            trial_id: self.trial_id,
            label: self.label,
            sequence_number: self.sequence_number,
            created_at: self.created_at,
            state,
        })
    }
}

/// Logical trial state carried inside a checkpoint blob. Fields written by
/// newer harnesses land in `extra` and are written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default = "state_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    pub bindings: Value,
    #[serde(default)]
    pub step: Option<u64>,
    #[serde(default)]
    pub harness_state: Value,
    #[serde(default)]
    pub environment: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn state_schema_version() -> String {
    CHECKPOINT_STATE_SCHEMA.to_string()
}

impl CheckpointState {
    pub fn new(bindings: Value, step: Option<u64>, harness_state: Value) -> Self {
        Self {
            schema_version: state_schema_version(),
            bindings,
            step,
            harness_state,
            environment: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> ControlResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ControlError::Storage(format!("undecodable checkpoint state: {}", e)))
    }

    pub fn to_bytes(&self) -> ControlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Append-only checkpoint persistence keyed by trial id.
pub struct CheckpointStore {
    root: PathBuf,
    index: Mutex<BTreeMap<String, Vec<Checkpoint>>>,
}

impl CheckpointStore {
    /// Opens (or creates) a store rooted at `root`, loading and verifying
    /// every checkpoint already on disk.
    pub fn open(root: &Path) -> ControlResult<Self> {
        ensure_dir(root)?;
        let mut index: BTreeMap<String, Vec<Checkpoint>> = BTreeMap::new();
        for entry in WalkDir::new(root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| ControlError::Storage(e.to_string()))?;
            let path = entry.path();
            let is_record = entry.file_type().is_file()
                && path.extension().and_then(|s| s.to_str()) == Some("json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            let checkpoint = read_checkpoint(path)?;
            index
                .entry(checkpoint.trial_id.clone())
                .or_default()
                .push(checkpoint);
        }
        for (trial_id, checkpoints) in index.iter_mut() {
            checkpoints.sort_by_key(|c| c.sequence_number);
            for (pos, checkpoint) in checkpoints.iter().enumerate() {
                if checkpoint.sequence_number != pos as u64 + 1 {
                    return Err(ControlError::Storage(format!(
                        "checkpoint sequence gap for trial {} at {}",
                        trial_id, checkpoint.sequence_number
                    )));
                }
            }
        }
        debug!(root = %root.display(), trials = index.len(), "checkpoint store opened");
        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, trial_id: &str, sequence_number: u64) -> PathBuf {
        self.root
            .join(trial_id)
            .join(format!("{:06}.json", sequence_number))
    }

    /// Persists `state` as the trial's next checkpoint. Sequence numbers start
    /// at 1 and are assigned under the store lock, so they are gap-free even
    /// with concurrent writers; the record is durable before this returns.
    pub fn append(&self, trial_id: &str, label: &str, state: Vec<u8>) -> ControlResult<Checkpoint> {
        if label.trim().is_empty() {
            return Err(ControlError::BadConfig(
                "checkpoint label must not be empty".to_string(),
            ));
        }
        let mut index = self
            .index
            .lock()
            .map_err(|_| ControlError::Storage("checkpoint index lock poisoned".to_string()))?;
        let entries = index.entry(trial_id.to_string()).or_default();
        let sequence_number = entries.last().map(|c| c.sequence_number).unwrap_or(0) + 1;
        let checkpoint = Checkpoint {
            trial_id: trial_id.to_string(),
            label: label.to_string(),
            sequence_number,
            created_at: Utc::now(),
            state,
        };
        let path = self.record_path(trial_id, sequence_number);
        if path.exists() {
            return Err(ControlError::Storage(format!(
                "refusing to overwrite checkpoint {}",
                path.display()
            )));
        }
        let bytes = serde_json::to_vec_pretty(&CheckpointRecord::encode(&checkpoint))?;
        atomic_write_bytes(&path, &bytes)?;
        entries.push(checkpoint.clone());
        info!(
            trial_id,
            label,
            sequence_number,
            "checkpoint committed"
        );
        Ok(checkpoint)
    }

    pub fn latest(&self, trial_id: &str) -> ControlResult<Option<Checkpoint>> {
        let index = self.lock_index()?;
        Ok(index.get(trial_id).and_then(|c| c.last().cloned()))
    }

    /// Most recent checkpoint with `label`.
    pub fn get(&self, trial_id: &str, label: &str) -> ControlResult<Checkpoint> {
        let index = self.lock_index()?;
        index
            .get(trial_id)
            .and_then(|c| c.iter().rev().find(|c| c.label == label).cloned())
            .ok_or_else(|| ControlError::CheckpointNotFound {
                trial_id: trial_id.to_string(),
                selector: format!("checkpoint:{}", label),
            })
    }

    pub fn sequence(&self, trial_id: &str, sequence_number: u64) -> ControlResult<Checkpoint> {
        let index = self.lock_index()?;
        index
            .get(trial_id)
            .and_then(|c| {
                c.iter()
                    .find(|c| c.sequence_number == sequence_number)
                    .cloned()
            })
            .ok_or_else(|| ControlError::CheckpointNotFound {
                trial_id: trial_id.to_string(),
                selector: format!("seq:{}", sequence_number),
            })
    }

    pub fn list(&self, trial_id: &str) -> ControlResult<Vec<Checkpoint>> {
        let index = self.lock_index()?;
        Ok(index.get(trial_id).cloned().unwrap_or_default())
    }

    pub fn contains_label(&self, trial_id: &str, label: &str) -> ControlResult<bool> {
        let index = self.lock_index()?;
        Ok(index
            .get(trial_id)
            .map(|c| c.iter().any(|c| c.label == label))
            .unwrap_or(false))
    }

    fn lock_index(
        &self,
    ) -> ControlResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<Checkpoint>>>> {
        self.index
            .lock()
            .map_err(|_| ControlError::Storage("checkpoint index lock poisoned".to_string()))
    }
}

fn read_checkpoint(path: &Path) -> ControlResult<Checkpoint> {
    let bytes = fs::read(path)?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ControlError::Storage(format!("{}: {}", path.display(), e)))?;
    lab_schemas::validate_value(CHECKPOINT_SCHEMA, &value)
        .map_err(|e| ControlError::Storage(format!("{}: {:#}", path.display(), e)))?;
    let record: CheckpointRecord = serde_json::from_value(value)
        .map_err(|e| ControlError::Storage(format!("{}: {}", path.display(), e)))?;
    record.decode(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TempDirGuard;
    use serde_json::json;

    #[test]
    fn append_assigns_gap_free_sequence_numbers_per_trial() {
        let dir = TempDirGuard::new("ckpt_seq");
        let store = CheckpointStore::open(&dir.path).expect("open");
        let a1 = store.append("trial_001", "step_1", b"a".to_vec()).expect("a1");
        let b1 = store.append("trial_002", "step_1", b"b".to_vec()).expect("b1");
        let a2 = store.append("trial_001", "step_2", b"c".to_vec()).expect("a2");
        assert_eq!(a1.sequence_number, 1);
        assert_eq!(b1.sequence_number, 1);
        assert_eq!(a2.sequence_number, 2);
        assert_eq!(
            store.latest("trial_001").expect("latest").map(|c| c.label),
            Some("step_2".to_string())
        );
    }

    #[test]
    fn get_returns_most_recent_checkpoint_with_label() {
        let dir = TempDirGuard::new("ckpt_label");
        let store = CheckpointStore::open(&dir.path).expect("open");
        store.append("t", "loop", b"1".to_vec()).expect("1");
        store.append("t", "other", b"2".to_vec()).expect("2");
        store.append("t", "loop", b"3".to_vec()).expect("3");
        let found = store.get("t", "loop").expect("get");
        assert_eq!(found.sequence_number, 3);
        assert_eq!(found.state, b"3".to_vec());
        let err = store.get("t", "missing").expect_err("absent");
        assert_eq!(err.code(), "checkpoint_not_found");
    }

    #[test]
    fn reopen_restores_blobs_byte_for_byte() {
        let dir = TempDirGuard::new("ckpt_reopen");
        let blob: Vec<u8> = (0u8..=255).collect();
        {
            let store = CheckpointStore::open(&dir.path).expect("open");
            store.append("trial_001", "before_tool_call", blob.clone()).expect("append");
        }
        let store = CheckpointStore::open(&dir.path).expect("reopen");
        let loaded = store.get("trial_001", "before_tool_call").expect("get");
        assert_eq!(loaded.state, blob);
        let next = store.append("trial_001", "after", Vec::new()).expect("append");
        assert_eq!(next.sequence_number, 2);
    }

    #[test]
    fn tampered_state_fails_digest_check() {
        let dir = TempDirGuard::new("ckpt_tamper");
        {
            let store = CheckpointStore::open(&dir.path).expect("open");
            store.append("t", "l", b"original".to_vec()).expect("append");
        }
        let path = dir.path.join("t").join("000001.json");
        let mut record: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        record["state"] = json!(BASE64.encode(b"tampered"));
        fs::write(&path, serde_json::to_vec(&record).expect("ser")).expect("write");
        let err = CheckpointStore::open(&dir.path).err().expect("digest mismatch");
        assert!(err.to_string().contains("digest mismatch"), "{}", err);
    }

    #[test]
    fn reads_inline_json_records_and_ignores_unknown_fields() {
        let dir = TempDirGuard::new("ckpt_legacy");
        let record = json!({
            "schema_version": "checkpoint_v1",
            "trial_id": "t",
            "label": "start",
            "sequence_number": 1,
            "created_at": "2025-01-01T00:00:00Z",
            "state_encoding": "json",
            "state": {"bindings": {"model": "a"}, "step": 1},
            "writer": "harness-sdk 0.9"
        });
        let path = dir.path.join("t").join("000001.json");
        atomic_write_bytes(&path, &serde_json::to_vec(&record).expect("ser")).expect("write");
        let store = CheckpointStore::open(&dir.path).expect("open");
        let state = store
            .latest("t")
            .expect("latest")
            .expect("present")
            .decode_state()
            .expect("decode");
        assert_eq!(state.bindings, json!({"model": "a"}));
        assert_eq!(state.step, Some(1));
    }

    #[test]
    fn records_failing_the_schema_are_rejected_on_open() {
        let dir = TempDirGuard::new("ckpt_schema");
        let record = json!({
            "schema_version": "checkpoint_v1",
            "trial_id": "t",
            "sequence_number": 1,
            "created_at": "2025-01-01T00:00:00Z",
            "state": "e30="
        });
        let path = dir.path.join("t").join("000001.json");
        atomic_write_bytes(&path, &serde_json::to_vec(&record).expect("ser")).expect("write");
        let err = CheckpointStore::open(&dir.path).err().expect("missing label");
        assert_eq!(err.code(), "storage_error");
        assert!(err.to_string().contains("checkpoint_v1"), "{}", err);
    }

    #[test]
    fn sequence_gap_on_disk_is_rejected() {
        let dir = TempDirGuard::new("ckpt_gap");
        {
            let store = CheckpointStore::open(&dir.path).expect("open");
            store.append("t", "a", b"1".to_vec()).expect("1");
            store.append("t", "b", b"2".to_vec()).expect("2");
        }
        fs::remove_file(dir.path.join("t").join("000001.json")).expect("remove");
        assert!(CheckpointStore::open(&dir.path).is_err());
    }

    #[test]
    fn state_document_preserves_unknown_fields() {
        let raw = json!({
            "schema_version": "checkpoint_state_v2",
            "bindings": {"temperature": 0.2},
            "step": 4,
            "harness_state": {"cursor": 9},
            "environment": {"task_id": "task_1"},
            "memory_snapshot": {"turns": 3}
        });
        let state = CheckpointState::from_bytes(&serde_json::to_vec(&raw).expect("ser")).expect("decode");
        assert_eq!(state.extra.get("memory_snapshot"), Some(&json!({"turns": 3})));
        let back: Value = serde_json::from_slice(&state.to_bytes().expect("encode")).expect("json");
        assert_eq!(back, raw);
    }
}
