//! Datasources: named, versioned snapshots of input data

use crate::core::{config::DatasourceConfig, fingerprint::content_hash, source::SourceRef};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Length of the hash prefix used as a derived version
const DERIVED_VERSION_LEN: usize = 12;

/// Datasource reference held by a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Datasource {
    pub name: String,
    pub source: SourceRef,
    pub args: Value,
    pub version: Option<String>,
}

impl Datasource {
    pub fn from_config(config: &DatasourceConfig) -> Result<Self> {
        let source = SourceRef::parse(&config.source)
            .map_err(|e| anyhow::anyhow!("Datasource '{}': {}", config.name, e))?;
        Ok(Self {
            name: config.name.clone(),
            source,
            args: config.args.clone(),
            version: config.version.clone(),
        })
    }

    /// Freeze loaded data into a snapshot
    pub fn snapshot(&self, payload: Value) -> DatasourceSnapshot {
        let content_hash = content_hash(&payload);
        let version = self
            .version
            .clone()
            .unwrap_or_else(|| content_hash[..DERIVED_VERSION_LEN].to_string());

        DatasourceSnapshot {
            name: self.name.clone(),
            version,
            content_hash,
            payload,
        }
    }
}

/// Data read from a datasource at run time
#[derive(Debug, Clone)]
pub struct DatasourceSnapshot {
    pub name: String,
    pub version: String,
    pub content_hash: String,
    pub payload: Value,
}

impl DatasourceSnapshot {
    pub fn record(&self, source: &SourceRef) -> DatasourceRecord {
        DatasourceRecord {
            name: self.name.clone(),
            version: self.version.clone(),
            source: source.to_string(),
            content_hash: self.content_hash.clone(),
            registered_at: Utc::now(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Datasource version as recorded in the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceRecord {
    pub name: String,
    pub version: String,
    pub source: String,
    pub content_hash: String,
    pub registered_at: DateTime<Utc>,
}
