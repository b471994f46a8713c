//! Artifact model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Prefix of the producer name given to datasource snapshots
pub const DATASOURCE_PRODUCER_PREFIX: &str = "datasource:";

/// A persisted output of a step (or a datasource snapshot)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,

    /// Output name within the producer
    pub name: String,

    /// Producing step name, or `datasource:<name>`
    pub producer: String,

    /// Run that first wrote the artifact
    pub run_id: Uuid,

    /// Fingerprint of the producing execution
    pub fingerprint: String,

    /// Hash of the payload
    pub content_hash: String,

    /// Location in the artifact store
    pub uri: String,

    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        producer: impl Into<String>,
        run_id: Uuid,
        fingerprint: impl Into<String>,
        content_hash: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            producer: producer.into(),
            run_id,
            fingerprint: fingerprint.into(),
            content_hash: content_hash.into(),
            uri: uri.into(),
            created_at: Utc::now(),
        }
    }

    /// Producer name for a datasource snapshot
    pub fn datasource_producer(datasource: &str) -> String {
        format!("{}{}", DATASOURCE_PRODUCER_PREFIX, datasource)
    }

    pub fn is_datasource(&self) -> bool {
        self.producer.starts_with(DATASOURCE_PRODUCER_PREFIX)
    }

    /// Key under which a downstream step sees this artifact
    pub fn input_key(&self) -> String {
        if self.is_datasource() {
            crate::core::config::DATASOURCE_INPUT.to_string()
        } else {
            output_key(&self.producer, &self.name)
        }
    }
}

/// Input key of a step output: `<step>.<output>`
pub fn output_key(step: &str, output: &str) -> String {
    format!("{}.{}", step, output)
}

/// Fail when two different step outputs would be handed over under the same key.
///
/// Every output is bound as `<step>.<output>`, and a single-output step is
/// also bound under its bare name. Names may contain dots, so `a` with output
/// `b.output` and `a.b` with output `output` both claim `a.b.output`.
pub fn check_input_keys<'a, I>(steps: I) -> Result<(), String>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let mut owners: HashMap<String, (&'a str, &'a str)> = HashMap::new();
    for (step, outputs) in steps {
        let mut keys: Vec<(String, &'a str)> = outputs
            .iter()
            .map(|output| (output_key(step, output), output.as_str()))
            .collect();
        if let [only] = outputs {
            keys.push((step.to_string(), only.as_str()));
        }

        for (key, output) in keys {
            match owners.get(&key) {
                Some(&(other_step, other_output)) if (other_step, other_output) != (step, output) => {
                    return Err(format!(
                        "input key '{}' is claimed by output '{}' of step '{}' and output '{}' of step '{}'",
                        key, other_output, other_step, output, step
                    ));
                }
                Some(_) => {}
                None => {
                    owners.insert(key, (step, output));
                }
            }
        }
    }
    Ok(())
}
