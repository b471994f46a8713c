//! Canonical JSON and content hashing
//!
//! Fingerprints are the cache key of a step: two executions with the same
//! fingerprint are interchangeable, so the previous artifacts can be reused.

use crate::core::Step;
use blake3::Hasher;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Serialize a JSON value with object keys sorted at every level
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(key, value)| (key, to_canonical_json(value)))
                .collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(key, value)| format!("{}:{}", Value::String(key.clone()), value))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// blake3 hex digest of a string
pub fn hash_str(input: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(input.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Hash of a payload's canonical form
pub fn content_hash(value: &Value) -> String {
    hash_str(&to_canonical_json(value))
}

/// Compute the cache key of a step.
///
/// `input_hashes` maps input keys (`step.output` or `datasource`) to the
/// content hash of the artifact bound to them. The pipeline name and run id
/// are left out so copies of a pipeline share cache entries.
pub fn step_fingerprint(step: &Step, input_hashes: &BTreeMap<String, String>) -> String {
    let inputs: Vec<Value> = input_hashes
        .iter()
        .map(|(key, hash)| json!([key, hash]))
        .collect();

    let descriptor = json!({
        "step": step.name,
        "source_path": step.source.path,
        "source_version": step.source.version_or_latest(),
        "args": step.args,
        "outputs": step.outputs,
        "inputs": inputs,
    });

    content_hash(&descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SourceRef, StepDefaults};

    fn step(args: Value) -> Step {
        Step::new(
            "trainer",
            SourceRef::parse("my.Trainer@1").unwrap(),
            args,
            vec!["split".to_string()],
            &StepDefaults::default(),
        )
    }

    #[test]
    fn test_object_keys_are_sorted() {
        let value = json!({ "z": [ { "y": "yes" }, null ], "a": { "x": 10 } });
        assert_eq!(
            to_canonical_json(&value),
            "{\"a\":{\"x\":10},\"z\":[{\"y\":\"yes\"},null]}"
        );
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a = json!({ "lr": 0.1, "epochs": 3 });
        let b = json!({ "epochs": 3, "lr": 0.1 });
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({ "epochs": 4, "lr": 0.1 })));
    }

    #[test]
    fn test_fingerprint_changes_with_args_and_inputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert("split.train".to_string(), "aaa".to_string());

        let base = step_fingerprint(&step(json!({ "epochs": 3 })), &inputs);
        assert_eq!(base, step_fingerprint(&step(json!({ "epochs": 3 })), &inputs));
        assert_ne!(base, step_fingerprint(&step(json!({ "epochs": 4 })), &inputs));

        inputs.insert("split.train".to_string(), "bbb".to_string());
        assert_ne!(base, step_fingerprint(&step(json!({ "epochs": 3 })), &inputs));
    }

    #[test]
    fn test_fingerprint_tracks_source_version() {
        let inputs = BTreeMap::new();
        let v1 = step(json!({}));
        let mut v2 = step(json!({}));
        v2.source = SourceRef::parse("my.Trainer@2").unwrap();
        assert_ne!(step_fingerprint(&v1, &inputs), step_fingerprint(&v2, &inputs));
    }
}
