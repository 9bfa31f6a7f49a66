//
// provenance.rs
// radifox
//
// Assembles sidecar and session records and writes them with temp-then-rename semantics.
//
// Thales Matheus Mendonça Santos - October 2026

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{SessionError, SessionResult};
use crate::models::{
    LookupTableRecord, ManualArgs, SeriesInfo, SessionInfo, SessionMetadata, SidecarRecord,
    VersionInfo,
};
use crate::naming::lookup::{LookupRow, LookupTable};
use crate::naming::manual::ManualNames;
use crate::storage::write_json_atomic;

/// Session-wide values stamped into every record of one conversion or update.
#[derive(Debug, Clone)]
pub struct ProvenanceRecorder {
    version: VersionInfo,
    input_hash: String,
    lookup_path: Option<String>,
    metadata: SessionMetadata,
    remove_identifiers: bool,
    manual_args: ManualArgs,
}

impl ProvenanceRecorder {
    pub fn new(
        version: VersionInfo,
        input_hash: String,
        lookup: &LookupTable,
        metadata: SessionMetadata,
        remove_identifiers: bool,
        manual_args: ManualArgs,
    ) -> Self {
        Self {
            version,
            input_hash,
            lookup_path: lookup.path().map(|p| p.display().to_string()),
            metadata,
            remove_identifiers,
            manual_args,
        }
    }

    /// `<prefix>_<name>`, the stem shared by image, sidecar and log.
    pub fn stem(&self, rendered_name: &str) -> String {
        format!("{}_{}", self.metadata.prefix(), rendered_name)
    }

    /// Sidecar listing only the look-up rows and manual entries that shaped this series.
    pub fn sidecar(
        &self,
        series: &SeriesInfo,
        lookup_rows: &[LookupRow],
        manual_entries: &BTreeMap<String, String>,
    ) -> SidecarRecord {
        SidecarRecord {
            version: self.version.clone(),
            input_hash: self.input_hash.clone(),
            lookup_table: LookupTableRecord {
                lookup_path: self.lookup_path.clone(),
                lookup_dict: lookup_rows.to_vec(),
            },
            manual_names: manual_entries.clone(),
            metadata: self.metadata.clone(),
            remove_identifiers: self.remove_identifiers,
            series_info: series.clone(),
        }
    }

    /// Writes `nii/<stem>.json`, replacing any previous sidecar wholesale.
    pub fn write_sidecar(
        &self,
        nii_dir: &Path,
        series: &SeriesInfo,
        lookup_rows: &[LookupRow],
        manual_entries: &BTreeMap<String, String>,
    ) -> SessionResult<PathBuf> {
        let stem = series.nifti_name.as_deref().ok_or_else(|| {
            SessionError::Invalid("sidecar requested for a series without an image".into())
        })?;
        let path = nii_dir.join(format!("{}.json", stem));
        write_json_atomic(&path, &self.sidecar(series, lookup_rows, manual_entries))?;
        Ok(path)
    }

    /// Session record covering every discovered series, with the full project table in effect.
    pub fn session_info(
        &self,
        lookup: &LookupTable,
        manual: &ManualNames,
        series_list: Vec<SeriesInfo>,
    ) -> SessionInfo {
        SessionInfo {
            version: self.version.clone(),
            input_hash: self.input_hash.clone(),
            lookup_table: LookupTableRecord {
                lookup_path: self.lookup_path.clone(),
                lookup_dict: lookup.rows().to_vec(),
            },
            manual_names: manual.entries().clone(),
            manual_args: self.manual_args.clone(),
            metadata: self.metadata.clone(),
            remove_identifiers: self.remove_identifiers,
            series_list,
        }
    }

    pub fn write_session_info(&self, session_dir: &Path, info: &SessionInfo) -> SessionResult<PathBuf> {
        let path = session_dir.join(SessionInfo::file_name(&self.metadata));
        write_json_atomic(&path, info)?;
        Ok(path)
    }
}

/// Reads the session record in `session_dir`, whatever prefix it was written under.
pub fn find_session_info(session_dir: &Path) -> SessionResult<(PathBuf, SessionInfo)> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(session_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with("_UnconvertedInfo.json"))
        })
        .collect();
    candidates.sort();
    let path = candidates
        .into_iter()
        .next()
        .ok_or_else(|| SessionError::Invalid(format!("no session record in {:?}", session_dir)))?;
    let info = read_json(&path)?;
    Ok((path, info))
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> SessionResult<T> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| SessionError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Field-level patch of an existing record. Keys the closure does not touch are kept as-is.
pub fn patch_record(path: &Path, patch: impl FnOnce(&mut Value)) -> SessionResult<()> {
    let mut value: Value = read_json(path)?;
    patch(&mut value);
    write_json_atomic(path, &value)?;
    Ok(())
}
