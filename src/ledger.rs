//
// ledger.rs
// radifox
//
// Per-session record of the naming version and override fingerprints behind the names on disk.
//
// Thales Matheus Mendonça Santos - October 2026

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::models::{SessionInfo, SessionMetadata};
use crate::naming::lookup::LookupTable;
use crate::naming::manual::ManualNames;
use crate::naming::NAMING_VERSION;
use crate::storage::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session record on disk.
    Unconverted,
    /// Session record present but no ledger to compare against.
    Converted,
    UpToDate,
    StaleNaming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionLedger {
    pub naming_version: String,
    pub lookup_fingerprint: String,
    pub manual_fingerprint: String,
    pub updated_at: String,
}

impl SessionLedger {
    pub fn current(lookup: &LookupTable, manual: &ManualNames) -> Self {
        Self {
            naming_version: NAMING_VERSION.to_string(),
            lookup_fingerprint: lookup.fingerprint(),
            manual_fingerprint: manual.fingerprint(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn file_path(session_dir: &Path, meta: &SessionMetadata) -> PathBuf {
        session_dir.join(format!("{}_Ledger.json", meta.prefix()))
    }

    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.exists() {
            return Err(LedgerError::Missing(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        write_json_atomic(path, self)?;
        Ok(())
    }

    /// Same naming inputs, ignoring when they were recorded.
    pub fn matches(&self, other: &SessionLedger) -> bool {
        self.naming_version == other.naming_version
            && self.lookup_fingerprint == other.lookup_fingerprint
            && self.manual_fingerprint == other.manual_fingerprint
    }
}

/// Classifies a session directory against the naming inputs currently in effect.
pub fn session_state(
    session_dir: &Path,
    meta: &SessionMetadata,
    current: &SessionLedger,
) -> Result<SessionState, LedgerError> {
    if !session_dir.join(SessionInfo::file_name(meta)).exists() {
        return Ok(SessionState::Unconverted);
    }
    match SessionLedger::load(&SessionLedger::file_path(session_dir, meta)) {
        Ok(recorded) if recorded.matches(current) => Ok(SessionState::UpToDate),
        Ok(_) => Ok(SessionState::StaleNaming),
        Err(LedgerError::Missing(_)) => Ok(SessionState::Converted),
        Err(err) => Err(err),
    }
}
