//! Source references identify the code behind a step or datasource

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static SOURCE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("valid source path regex")
});

/// A `dotted.path[@version]` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: String,
    pub version: Option<String>,
}

impl SourceRef {
    pub fn new(path: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            path: path.into(),
            version: version.map(str::to_string),
        }
    }

    /// Parse a source string such as `mlpipeline.steps.Split@0.1.0`
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (path, version) = match raw.rsplit_once('@') {
            Some((path, version)) => {
                if version.is_empty() {
                    return Err(format!("source '{}' has an empty version", raw));
                }
                (path, Some(version.to_string()))
            }
            None => (raw, None),
        };

        if !SOURCE_PATH.is_match(path) {
            return Err(format!("source '{}' is not a dotted path", raw));
        }

        Ok(Self {
            path: path.to_string(),
            version,
        })
    }

    /// Version string used in fingerprints and the repository
    pub fn version_or_latest(&self) -> &str {
        self.version.as_deref().unwrap_or("latest")
    }
}

impl FromStr for SourceRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.path, version),
            None => write!(f, "{}", self.path),
        }
    }
}
