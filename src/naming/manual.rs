use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SessionError;
use crate::models::SessionMetadata;
use crate::storage::{canonical_json, sha256_hex};

/// Per-session manual naming entries, keyed by `dcm/`-relative source path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualNames {
    entries: BTreeMap<String, String>,
}

impl ManualNames {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn file_path(session_dir: &Path, meta: &SessionMetadata) -> PathBuf {
        session_dir.join(format!("{}_ManualNaming.json", meta.prefix()))
    }

    /// Missing file means no manual entries.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let entries = serde_json::from_str(&text).map_err(|source| SessionError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { entries })
    }

    pub fn get(&self, source_path: &str) -> Option<&str> {
        self.entries.get(source_path).map(|s| s.as_str())
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn fingerprint(&self) -> String {
        let canonical = canonical_json(&self.entries).unwrap_or_default();
        sha256_hex(canonical.as_bytes())
    }
}
