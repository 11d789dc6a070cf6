use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");
static COMPILED: OnceLock<Mutex<BTreeMap<String, Arc<JSONSchema>>>> = OnceLock::new();

fn schema_file_name(name: &str) -> String {
    if name.ends_with(".jsonschema") {
        name.to_string()
    } else {
        format!("{}.jsonschema", name)
    }
}

pub fn schema_names() -> Vec<String> {
    let mut names: Vec<String> = SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect();
    names.sort();
    names
}

/// Accepts either the file name or the bare schema id (`trial_output_v1`).
pub fn load_schema(name: &str) -> Result<Value> {
    let file_name = schema_file_name(name);
    let name = file_name.as_str();
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Schema files added after the last build are picked up from the source tree.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

/// Compiles the named schema once per process; later calls share it.
pub fn compile_schema(name: &str) -> Result<Arc<JSONSchema>> {
    let key = schema_file_name(name);
    let cache = COMPILED.get_or_init(|| Mutex::new(BTreeMap::new()));
    if let Some(compiled) = cache
        .lock()
        .map_err(|_| anyhow!("schema cache poisoned"))?
        .get(&key)
    {
        return Ok(compiled.clone());
    }
    let schema = load_schema(&key)?;
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| anyhow!("schema {} failed to compile: {}", key, e))?;
    let mut cache = cache.lock().map_err(|_| anyhow!("schema cache poisoned"))?;
    Ok(cache.entry(key).or_insert_with(|| Arc::new(compiled)).clone())
}

/// Validates `value` against the named schema and reports every error in one message.
pub fn validate_value(name: &str, value: &Value) -> Result<()> {
    let compiled = compile_schema(name)?;
    let msgs: Vec<String> = match compiled.validate(value) {
        Ok(()) => return Ok(()),
        Err(errors) => errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect(),
    };
    Err(anyhow!(
        "schema validation failed ({}): {}",
        name,
        msgs.join("; ")
    ))
}
