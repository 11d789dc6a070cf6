//! Knob manifests, override documents, and the validation/apply engine that
//! guards every parameter change before it reaches a trial.

use crate::error::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const KNOB_MANIFEST_SCHEMA: &str = "knob_manifest_v1";
pub const OVERRIDES_SCHEMA: &str = "experiment_overrides_v1";
pub const DEFAULT_MANIFEST_PATH: &str = ".lab/knobs/manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobType {
    String,
    Number,
    Integer,
    Boolean,
    Enum,
}

impl KnobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnobType::String => "string",
            KnobType::Number => "number",
            KnobType::Integer => "integer",
            KnobType::Boolean => "boolean",
            KnobType::Enum => "enum",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            KnobType::String => value.is_string(),
            KnobType::Number => value.is_number(),
            KnobType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            KnobType::Boolean => value.is_boolean(),
            // membership in `options` is the only constraint
            KnobType::Enum => !value.is_null(),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, KnobType::Number | KnobType::Integer)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobRole {
    #[default]
    Core,
    Harness,
    Infra,
    Benchmark,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScientificRole {
    Treatment,
    #[default]
    Control,
    Confound,
    Invariant,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub json_pointer: String,
    #[serde(rename = "type")]
    pub value_type: KnobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub role: KnobRole,
    #[serde(default)]
    pub scientific_role: ScientificRole,
}

impl KnobDefinition {
    /// Every constraint `value` breaks. A type mismatch short-circuits the
    /// option and bound checks, which would only repeat the same complaint.
    pub fn check(&self, value: &Value) -> Vec<Violation> {
        if !self.value_type.accepts(value) {
            return vec![Violation::TypeMismatch {
                knob_id: self.id.clone(),
                expected: self.value_type.as_str().to_string(),
                found: value_type_name(value).to_string(),
            }];
        }

        let mut violations = Vec::new();
        if let Some(options) = self.options.as_ref() {
            if !options.iter().any(|opt| opt == value) {
                violations.push(Violation::NotInOptions {
                    knob_id: self.id.clone(),
                    value: value.clone(),
                    options: options.clone(),
                });
            }
        }
        if self.value_type.is_numeric() {
            if let Some(v) = value.as_f64() {
                if let Some(min) = self.minimum {
                    if v < min {
                        violations.push(Violation::BelowMinimum {
                            knob_id: self.id.clone(),
                            minimum: min,
                            value: value.clone(),
                        });
                    }
                }
                if let Some(max) = self.maximum {
                    if v > max {
                        violations.push(Violation::AboveMaximum {
                            knob_id: self.id.clone(),
                            maximum: max,
                            value: value.clone(),
                        });
                    }
                }
            }
        }
        violations
    }

    fn definition_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.id.trim().is_empty() {
            problems.push("knob with empty id".to_string());
        }
        if !self.json_pointer.starts_with('/') {
            problems.push(format!(
                "knob {}: json_pointer must start with '/': {}",
                self.id, self.json_pointer
            ));
        }
        if self.value_type == KnobType::Enum
            && self.options.as_ref().map(|o| o.is_empty()).unwrap_or(true)
        {
            problems.push(format!("knob {}: enum type requires options", self.id));
        }
        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                problems.push(format!(
                    "knob {}: minimum {} exceeds maximum {}",
                    self.id, min, max
                ));
            }
        }
        if (self.minimum.is_some() || self.maximum.is_some()) && !self.value_type.is_numeric() {
            problems.push(format!(
                "knob {}: bounds declared on non-numeric type {}",
                self.id,
                self.value_type.as_str()
            ));
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    UnknownKnob {
        knob_id: String,
    },
    TypeMismatch {
        knob_id: String,
        expected: String,
        found: String,
    },
    NotInOptions {
        knob_id: String,
        value: Value,
        options: Vec<Value>,
    },
    BelowMinimum {
        knob_id: String,
        minimum: f64,
        value: Value,
    },
    AboveMaximum {
        knob_id: String,
        maximum: f64,
        value: Value,
    },
    UnresolvedPointer {
        knob_id: String,
        pointer: String,
    },
}

impl Violation {
    pub fn knob_id(&self) -> &str {
        match self {
            Violation::UnknownKnob { knob_id }
            | Violation::TypeMismatch { knob_id, .. }
            | Violation::NotInOptions { knob_id, .. }
            | Violation::BelowMinimum { knob_id, .. }
            | Violation::AboveMaximum { knob_id, .. }
            | Violation::UnresolvedPointer { knob_id, .. } => knob_id,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnknownKnob { knob_id } => {
                write!(f, "override references unknown knob id: {}", knob_id)
            }
            Violation::TypeMismatch {
                knob_id,
                expected,
                found,
            } => write!(
                f,
                "value type mismatch for knob {}: expected {}, got {}",
                knob_id, expected, found
            ),
            Violation::NotInOptions { knob_id, value, .. } => write!(
                f,
                "value {} for knob {} is not in allowed options",
                value, knob_id
            ),
            Violation::BelowMinimum {
                knob_id,
                minimum,
                value,
            } => write!(
                f,
                "value {} for knob {} is below minimum {}",
                value, knob_id, minimum
            ),
            Violation::AboveMaximum {
                knob_id,
                maximum,
                value,
            } => write!(
                f,
                "value {} for knob {} is above maximum {}",
                value, knob_id, maximum
            ),
            Violation::UnresolvedPointer { knob_id, pointer } => write!(
                f,
                "json_pointer {} for knob {} does not resolve in the configuration",
                pointer, knob_id
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> ControlResult<()> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ControlError::ValidationFailed {
                violations: self.violations,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobManifest {
    pub schema_version: String,
    pub knobs: Vec<KnobDefinition>,
}

impl KnobManifest {
    pub fn empty() -> Self {
        Self {
            schema_version: KNOB_MANIFEST_SCHEMA.to_string(),
            knobs: Vec::new(),
        }
    }

    pub fn from_value(value: Value) -> ControlResult<Self> {
        lab_schemas::validate_value("knob_manifest_v1.jsonschema", &value)
            .map_err(|e| ControlError::BadConfig(format!("knob manifest: {:#}", e)))?;
        let manifest: KnobManifest = serde_json::from_value(value)
            .map_err(|e| ControlError::BadConfig(format!("knob manifest: {}", e)))?;
        if manifest.schema_version != KNOB_MANIFEST_SCHEMA {
            return Err(ControlError::BadConfig(format!(
                "unsupported knob manifest schema_version: {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> ControlResult<Self> {
        let value = lab_core::load_json_file(path)
            .map_err(|e| ControlError::BadConfig(format!("{:#}", e)))?;
        Self::from_value(value)
    }

    pub fn get(&self, id: &str) -> Option<&KnobDefinition> {
        self.knobs.iter().find(|k| k.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobOverrides {
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl KnobOverrides {
    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self {
            schema_version: OVERRIDES_SCHEMA.to_string(),
            manifest_path: None,
            values,
        }
    }

    pub fn from_value(value: Value) -> ControlResult<Self> {
        lab_schemas::validate_value("experiment_overrides_v1.jsonschema", &value)
            .map_err(|e| ControlError::BadConfig(format!("overrides: {:#}", e)))?;
        let overrides: KnobOverrides = serde_json::from_value(value)
            .map_err(|e| ControlError::BadConfig(format!("overrides: {}", e)))?;
        if overrides.schema_version != OVERRIDES_SCHEMA {
            return Err(ControlError::BadConfig(format!(
                "unsupported overrides schema_version: {}",
                overrides.schema_version
            )));
        }
        Ok(overrides)
    }

    pub fn load(path: &Path) -> ControlResult<Self> {
        let value = lab_core::load_json_file(path)
            .map_err(|e| ControlError::BadConfig(format!("{:#}", e)))?;
        Self::from_value(value)
    }

    /// Manifest referenced by this document, relative paths resolved against `project_root`.
    pub fn resolve_manifest_path(&self, project_root: &Path) -> PathBuf {
        let rel = self
            .manifest_path
            .clone()
            .unwrap_or_else(|| DEFAULT_MANIFEST_PATH.to_string());
        if Path::new(&rel).is_absolute() {
            PathBuf::from(rel)
        } else {
            project_root.join(rel)
        }
    }
}

/// Validates and applies overrides against one manifest.
#[derive(Debug, Clone)]
pub struct KnobEngine {
    manifest: KnobManifest,
    by_id: BTreeMap<String, usize>,
}

impl KnobEngine {
    /// Rejects manifests with duplicate ids, enums without options, inverted
    /// bounds or malformed pointers, reporting every problem at once.
    pub fn new(manifest: KnobManifest) -> ControlResult<Self> {
        let mut problems = Vec::new();
        let mut by_id = BTreeMap::new();
        for (idx, knob) in manifest.knobs.iter().enumerate() {
            problems.extend(knob.definition_problems());
            if by_id.insert(knob.id.clone(), idx).is_some() {
                problems.push(format!("duplicate knob id: {}", knob.id));
            }
        }
        if !problems.is_empty() {
            return Err(ControlError::BadConfig(format!(
                "invalid knob manifest: {}",
                problems.join("; ")
            )));
        }
        Ok(Self { manifest, by_id })
    }

    pub fn empty() -> Self {
        Self {
            manifest: KnobManifest::empty(),
            by_id: BTreeMap::new(),
        }
    }

    pub fn load(manifest_path: &Path) -> ControlResult<Self> {
        Self::new(KnobManifest::load(manifest_path)?)
    }

    pub fn manifest(&self) -> &KnobManifest {
        &self.manifest
    }

    pub fn knob(&self, id: &str) -> Option<&KnobDefinition> {
        self.by_id.get(id).map(|idx| &self.manifest.knobs[*idx])
    }

    pub fn validate(&self, overrides: &KnobOverrides) -> ValidationReport {
        self.validate_values(&overrides.values)
    }

    pub fn validate_values(&self, values: &BTreeMap<String, Value>) -> ValidationReport {
        let mut violations = Vec::new();
        for (id, value) in values {
            match self.knob(id) {
                Some(knob) => violations.extend(knob.check(value)),
                None => violations.push(Violation::UnknownKnob {
                    knob_id: id.clone(),
                }),
            }
        }
        ValidationReport { violations }
    }

    /// Returns a copy of `config` with every overridden pointer replaced.
    /// Pointers must already resolve; `config` itself is left untouched.
    pub fn apply(&self, config: &Value, overrides: &KnobOverrides) -> ControlResult<Value> {
        let mut report = self.validate(overrides);
        for id in overrides.values.keys() {
            if let Some(knob) = self.knob(id) {
                if config.pointer(&knob.json_pointer).is_none() {
                    report.violations.push(Violation::UnresolvedPointer {
                        knob_id: id.clone(),
                        pointer: knob.json_pointer.clone(),
                    });
                }
            }
        }
        report.into_result()?;

        let mut resolved = config.clone();
        for (id, value) in &overrides.values {
            if let Some(knob) = self.knob(id) {
                if let Some(slot) = resolved.pointer_mut(&knob.json_pointer) {
                    *slot = value.clone();
                }
            }
        }
        Ok(resolved)
    }

    /// Checks binding overrides for fork/resume. Binding keys are knob ids.
    /// Strict mode fails on any violation; otherwise violations come back as
    /// warnings and the caller proceeds.
    pub fn validate_bindings(
        &self,
        bindings: &BTreeMap<String, Value>,
        strict: bool,
    ) -> ControlResult<Vec<Violation>> {
        let report = self.validate_values(bindings);
        if strict {
            report.into_result()?;
            return Ok(Vec::new());
        }
        for violation in &report.violations {
            warn!(
                knob_id = violation.knob_id(),
                "binding override accepted with violation: {}",
                violation
            );
        }
        Ok(report.violations)
    }
}

/// Loads an overrides document and its manifest, then applies it to `config`.
pub fn apply_overrides_file(
    config: &Value,
    overrides_path: &Path,
    project_root: &Path,
) -> ControlResult<(Value, KnobEngine)> {
    let overrides = KnobOverrides::load(overrides_path)?;
    let engine = KnobEngine::load(&overrides.resolve_manifest_path(project_root))?;
    let resolved = engine.apply(config, &overrides)?;
    Ok((resolved, engine))
}

/// Merges binding overrides on top of `bindings`. Dotted keys address nested
/// objects, which are created as needed.
pub fn merge_bindings(bindings: &Value, overrides: &BTreeMap<String, Value>) -> ControlResult<Value> {
    let mut merged = match bindings {
        Value::Object(map) => Value::Object(map.clone()),
        Value::Null => Value::Object(Map::new()),
        other => {
            return Err(ControlError::BadConfig(format!(
                "bindings must be an object, found {}",
                value_type_name(other)
            )))
        }
    };
    for (key, value) in overrides {
        let tokens: Vec<&str> = key.split('.').collect();
        let mut cur = &mut merged;
        for token in &tokens[..tokens.len() - 1] {
            let Value::Object(map) = cur else {
                return Err(ControlError::BadConfig(format!(
                    "binding {} traverses a non-object value at {}",
                    key, token
                )));
            };
            cur = map
                .entry(token.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let Value::Object(map) = cur else {
            return Err(ControlError::BadConfig(format!(
                "binding {} traverses a non-object value",
                key
            )));
        };
        let last = tokens[tokens.len() - 1];
        map.insert(last.to_string(), value.clone());
    }
    Ok(merged)
}

pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temperature_manifest() -> KnobManifest {
        KnobManifest::from_value(json!({
            "schema_version": "knob_manifest_v1",
            "knobs": [
                {
                    "id": "temperature",
                    "json_pointer": "/variants/0/bindings/temperature",
                    "type": "number",
                    "minimum": 0,
                    "maximum": 2,
                    "scientific_role": "treatment"
                },
                {
                    "id": "model",
                    "json_pointer": "/variants/0/bindings/model",
                    "type": "enum",
                    "options": ["x", "y"]
                },
                {
                    "id": "max_steps",
                    "json_pointer": "/design/max_steps",
                    "type": "integer",
                    "minimum": 1,
                    "role": "harness"
                }
            ]
        }))
        .expect("manifest")
    }

    fn config() -> Value {
        json!({
            "design": {"replications": 1},
            "variants": [
                {"variant_id": "v0", "bindings": {"temperature": 1.0, "model": "x"}}
            ]
        })
    }

    fn overrides(values: Value) -> KnobOverrides {
        let values: BTreeMap<String, Value> = serde_json::from_value(values).expect("values");
        KnobOverrides::from_values(values)
    }

    #[test]
    fn out_of_bounds_temperature_reports_bound_violation() {
        let engine = KnobEngine::new(temperature_manifest()).expect("engine");
        let report = engine.validate(&overrides(json!({"temperature": 3.5})));
        assert_eq!(report.violations.len(), 1);
        assert!(matches!(
            report.violations[0],
            Violation::AboveMaximum { ref knob_id, maximum, .. } if knob_id == "temperature" && maximum == 2.0
        ));
    }

    #[test]
    fn apply_replaces_pointer_and_leaves_original_untouched() {
        let engine = KnobEngine::new(temperature_manifest()).expect("engine");
        let original = config();
        let resolved = engine
            .apply(&original, &overrides(json!({"temperature": 0.7})))
            .expect("apply");
        assert_eq!(
            resolved.pointer("/variants/0/bindings/temperature"),
            Some(&json!(0.7))
        );
        assert_eq!(
            original.pointer("/variants/0/bindings/temperature"),
            Some(&json!(1.0))
        );
    }

    #[test]
    fn validate_collects_every_violation() {
        let engine = KnobEngine::new(temperature_manifest()).expect("engine");
        let report = engine.validate(&overrides(json!({
            "temperature": "hot",
            "model": "z",
            "max_steps": 0,
            "seed": 4
        })));
        let kinds: Vec<String> = report
            .violations
            .iter()
            .map(|v| serde_json::to_value(v).expect("ser")["kind"].as_str().unwrap_or("").to_string())
            .collect();
        assert_eq!(report.violations.len(), 4, "{:?}", report.violations);
        assert!(kinds.contains(&"type_mismatch".to_string()));
        assert!(kinds.contains(&"not_in_options".to_string()));
        assert!(kinds.contains(&"below_minimum".to_string()));
        assert!(kinds.contains(&"unknown_knob".to_string()));
    }

    #[test]
    fn integer_knob_rejects_fractional_values() {
        let engine = KnobEngine::new(temperature_manifest()).expect("engine");
        let report = engine.validate(&overrides(json!({"max_steps": 2.5})));
        assert!(matches!(report.violations[0], Violation::TypeMismatch { .. }));
    }

    #[test]
    fn apply_never_creates_missing_paths() {
        let engine = KnobEngine::new(temperature_manifest()).expect("engine");
        let err = engine
            .apply(&config(), &overrides(json!({"max_steps": 5})))
            .expect_err("pointer does not resolve");
        match err {
            ControlError::ValidationFailed { violations } => {
                assert!(matches!(violations[0], Violation::UnresolvedPointer { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn duplicate_ids_and_enum_without_options_are_bad_config() {
        let manifest = KnobManifest {
            schema_version: KNOB_MANIFEST_SCHEMA.to_string(),
            knobs: vec![
                KnobDefinition {
                    id: "a".to_string(),
                    label: None,
                    json_pointer: "/a".to_string(),
                    value_type: KnobType::Enum,
                    options: None,
                    minimum: None,
                    maximum: None,
                    role: KnobRole::Core,
                    scientific_role: ScientificRole::Control,
                },
                KnobDefinition {
                    id: "a".to_string(),
                    label: None,
                    json_pointer: "/b".to_string(),
                    value_type: KnobType::Number,
                    options: None,
                    minimum: Some(3.0),
                    maximum: Some(1.0),
                    role: KnobRole::Core,
                    scientific_role: ScientificRole::Control,
                },
            ],
        };
        let err = KnobEngine::new(manifest).expect_err("invalid manifest");
        let msg = err.to_string();
        assert!(msg.contains("duplicate knob id: a"), "{}", msg);
        assert!(msg.contains("enum type requires options"), "{}", msg);
        assert!(msg.contains("minimum 3 exceeds maximum 1"), "{}", msg);
    }

    #[test]
    fn manifest_schema_rejects_wrong_version() {
        let err = KnobManifest::from_value(json!({
            "schema_version": "knob_manifest_v0",
            "knobs": []
        }))
        .expect_err("version");
        assert_eq!(err.code(), "bad_config");
    }

    #[test]
    fn strict_binding_validation_fails_but_lenient_returns_warnings() {
        let engine = KnobEngine::new(temperature_manifest()).expect("engine");
        let mut bindings = BTreeMap::new();
        bindings.insert("unknown_key".to_string(), json!(1));
        let err = engine
            .validate_bindings(&bindings, true)
            .expect_err("strict");
        assert_eq!(err.code(), "validation_failed");
        let warnings = engine.validate_bindings(&bindings, false).expect("lenient");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].knob_id(), "unknown_key");
    }

    #[test]
    fn merge_bindings_nests_dotted_keys_without_mutating_input() {
        let base = json!({"model": "a", "tools": {"search": true}});
        let mut set = BTreeMap::new();
        set.insert("model".to_string(), json!("x"));
        set.insert("tools.browser".to_string(), json!(false));
        let merged = merge_bindings(&base, &set).expect("merge");
        assert_eq!(
            merged,
            json!({"model": "x", "tools": {"search": true, "browser": false}})
        );
        assert_eq!(base["model"], "a");
    }

    #[test]
    fn merge_bindings_rejects_traversal_through_scalars() {
        let base = json!({"model": "a"});
        let mut set = BTreeMap::new();
        set.insert("model.name".to_string(), json!("x"));
        assert!(merge_bindings(&base, &set).is_err());
    }
}
