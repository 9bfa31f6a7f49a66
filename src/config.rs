//
// config.rs
// radifox
//
// Loads optional TOML settings (converter, naming, anonymization, batch) with defaults for every key.
//
// Thales Matheus Mendonça Santos - October 2026

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How an override's extras combine with the base name's extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtrasMode {
    #[default]
    Replace,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterSettings {
    pub program: String,
    pub timeout_secs: u64,
    pub extra_args: Vec<String>,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            program: "dcm2niix".to_string(),
            timeout_secs: 600,
            extra_args: Vec::new(),
        }
    }
}

impl ConverterSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingSettings {
    pub extras_mode: ExtrasMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizationSettings {
    /// Random bytes per anonymous id (rendered as upper-case hex).
    pub id_bytes: usize,
    /// Fixed shift for new subjects; random within `max_random_shift_days` when unset.
    pub date_shift_days: Option<i64>,
    /// Zero disables random shifting.
    pub max_random_shift_days: i64,
    pub uid_root: String,
}

impl Default for AnonymizationSettings {
    fn default() -> Self {
        Self {
            id_bytes: 6,
            date_shift_days: None,
            max_random_shift_days: 365,
            uid_root: "2.25".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_concurrent_subjects: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_subjects: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub converter: ConverterSettings,
    pub naming: NamingSettings,
    pub anonymization: AnonymizationSettings,
    pub batch: BatchSettings,
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid settings file")
    }

    /// Reads the settings file when one is given, otherwise falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file {:?}", path))?;
                Self::from_toml_str(&content)
            }
            None => Ok(Self::default()),
        }
    }
}

/// Default look-up table location for a project.
pub fn default_lut_path(output_root: &Path, project: &str) -> PathBuf {
    let project = project.to_lowercase();
    output_root
        .join(&project)
        .join(format!("{}-lut.csv", project))
}
