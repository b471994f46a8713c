//! Global settings stored in the user config directory
//!
//! Settings hold named profiles. The active profile decides which repository
//! commands work against.

use crate::core::config::is_valid_name;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const SETTINGS_FILE: &str = "settings.yaml";

/// Prefix of the environment variables that override settings fields
pub const ENV_PREFIX: &str = "MLPIPE_";

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Profile every settings file has
pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Repository location; defaults to a directory under the user data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Anonymous id generated on first use
    pub user_id: Uuid,

    /// Crate version that last wrote the file
    pub version: String,

    #[serde(default = "default_profile")]
    pub active_profile: String,

    #[serde(default)]
    pub profiles: IndexMap<String, Profile>,

    /// Top-level repository path of older files, moved into the default profile
    #[serde(default, rename = "repository_path", skip_serializing)]
    legacy_repository_path: Option<PathBuf>,

    /// Default log filter, e.g. `info` or `mlpipeline=debug`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: Uuid::new_v4(),
            version: CRATE_VERSION.to_string(),
            active_profile: default_profile(),
            profiles: [(default_profile(), Profile::default())].into_iter().collect(),
            legacy_repository_path: None,
            log_level: None,
        }
    }
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

impl Settings {
    /// Load settings from the user config directory, creating them on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_dir())
    }

    /// `mlpipeline` under the user config directory
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mlpipeline")
    }

    /// Load settings from `dir`, then apply `MLPIPE_*` environment overrides
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut settings = Self::read_or_create(dir)?;
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Load settings from `dir` as stored, without environment overrides
    pub fn read_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            let settings = Settings::default();
            settings.save(dir)?;
            info!("Created settings at {}", path.display());
            return Ok(settings);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let moved = settings.migrate_profiles();

        match compare_versions(&settings.version, CRATE_VERSION) {
            Ordering::Greater => anyhow::bail!(
                "{} was written by mlpipeline {}, which is newer than this version ({})",
                path.display(),
                settings.version,
                CRATE_VERSION
            ),
            Ordering::Less => {
                info!("Migrating settings from {} to {}", settings.version, CRATE_VERSION);
                settings.version = CRATE_VERSION.to_string();
                settings.save(dir)?;
            }
            Ordering::Equal if moved => settings.save(dir)?,
            Ordering::Equal => debug!("Loaded settings from {}", path.display()),
        }

        Ok(settings)
    }

    /// Write the settings file
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(SETTINGS_FILE);
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Override fields from `MLPIPE_<FIELD>` variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| lookup(&format!("{}{}", ENV_PREFIX, field.to_uppercase()));

        if let Some(user_id) = var("user_id") {
            self.user_id = Uuid::parse_str(&user_id).with_context(|| format!("Invalid {}USER_ID", ENV_PREFIX))?;
        }
        if let Some(version) = var("version") {
            self.version = version;
        }
        if let Some(profile) = var("profile") {
            self.activate_profile(&profile)
                .with_context(|| format!("Invalid {}PROFILE", ENV_PREFIX))?;
        }
        if let Some(path) = var("repository_path") {
            self.profiles.entry(self.active_profile.clone()).or_default().repository_path = Some(PathBuf::from(path));
        }
        if let Some(level) = var("log_level") {
            self.log_level = Some(level);
        }
        Ok(())
    }

    /// Directory of the repository the active profile points at
    pub fn repository_root(&self) -> PathBuf {
        self.profile_root(&self.active_profile)
    }

    /// Directory of the repository a profile points at
    pub fn profile_root(&self, name: &str) -> PathBuf {
        if let Some(path) = self.profiles.get(name).and_then(|profile| profile.repository_path.clone()) {
            return path;
        }
        let data = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mlpipeline");
        if name == DEFAULT_PROFILE {
            data
        } else {
            data.join("profiles").join(name)
        }
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn create_profile(&mut self, name: &str, repository_path: Option<PathBuf>) -> Result<()> {
        if !is_valid_name(name) {
            anyhow::bail!("Invalid profile name '{}'", name);
        }
        if self.profiles.contains_key(name) {
            anyhow::bail!("Profile '{}' already exists", name);
        }
        self.profiles.insert(name.to_string(), Profile { repository_path });
        info!("Created profile {}", name);
        Ok(())
    }

    pub fn activate_profile(&mut self, name: &str) -> Result<()> {
        if !self.profiles.contains_key(name) {
            anyhow::bail!("Profile '{}' not found", name);
        }
        self.active_profile = name.to_string();
        Ok(())
    }

    /// Remove a profile; its repository stays on disk
    pub fn delete_profile(&mut self, name: &str) -> Result<Profile> {
        if name == DEFAULT_PROFILE {
            anyhow::bail!("The default profile cannot be deleted");
        }
        if name == self.active_profile {
            anyhow::bail!("Profile '{}' is active; activate another one first", name);
        }
        let profile = self
            .profiles
            .shift_remove(name)
            .with_context(|| format!("Profile '{}' not found", name))?;
        info!("Deleted profile {}", name);
        Ok(profile)
    }

    /// Move a top-level repository path into the default profile; true if anything changed
    fn migrate_profiles(&mut self) -> bool {
        let mut changed = false;
        if !self.profiles.contains_key(DEFAULT_PROFILE) {
            self.profiles.insert(default_profile(), Profile::default());
            changed = true;
        }
        if let Some(path) = self.legacy_repository_path.take() {
            let profile = self.profiles.entry(default_profile()).or_default();
            if profile.repository_path.is_none() {
                profile.repository_path = Some(path);
            }
            changed = true;
        }
        if !self.profiles.contains_key(&self.active_profile) {
            self.active_profile = default_profile();
            changed = true;
        }
        changed
    }
}

/// Compare dotted version strings numerically; non-numeric parts count as zero
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split(['.', '-', '+'])
            .take(3)
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
