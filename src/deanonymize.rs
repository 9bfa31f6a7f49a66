//
// deanonymize.rs
// radifox
//
// Restores real subject identifiers in directory names, file prefixes and recorded fields.
//
// Thales Matheus Mendonça Santos - October 2026

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::anonymize::{hash_identifier, shift_date, AnonymizationStore, SessionRecord, SubjectRecord};
use crate::error::{SessionError, SessionResult};
use crate::models::SessionMetadata;
use crate::provenance::patch_record;

/// Which subjects to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeanonymizeTarget {
    All,
    Patient(String),
    /// Anonymous subject id as it appears in the output tree.
    Anonymous(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeanonymizeReport {
    pub subjects: usize,
    pub sessions: usize,
    pub files_renamed: usize,
    /// Subjects left anonymized: `(anon_id, reason)`.
    pub failed: Vec<(String, String)>,
}

impl DeanonymizeReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Looks every target up in the mapping store before touching the project directory.
/// A subject that cannot be restored is reported in `failed` and the rest continue.
pub async fn deanonymize(
    store: &AnonymizationStore,
    project_dir: &Path,
    project_id: &str,
    target: &DeanonymizeTarget,
) -> SessionResult<DeanonymizeReport> {
    if !project_dir.is_dir() {
        return Err(SessionError::Invalid(format!(
            "project directory {:?} does not exist",
            project_dir
        )));
    }
    let subjects = match target {
        DeanonymizeTarget::All => store.subjects().await?,
        DeanonymizeTarget::Patient(patient_id) => vec![store.subject_by_patient_id(patient_id).await?],
        DeanonymizeTarget::Anonymous(anon_id) => vec![store.subject_by_anon_id(anon_id).await?],
    };

    let mut report = DeanonymizeReport::default();
    for subject in &subjects {
        let sessions = store.sessions_for(&subject.anon_id).await?;
        match deanonymize_subject(project_dir, project_id, subject, &sessions) {
            Ok(restored) => {
                report.subjects += restored.subjects;
                report.sessions += restored.sessions;
                report.files_renamed += restored.files_renamed;
            }
            Err(err) => {
                warn!("Cannot restore {}: {}", subject.anon_id, err);
                report.failed.push((subject.anon_id.clone(), err.to_string()));
            }
        }
    }
    Ok(report)
}

/// Restores one subject. The subject directory is renamed last, so an interrupted run
/// can be repeated.
pub fn deanonymize_subject(
    project_dir: &Path,
    project_id: &str,
    subject: &SubjectRecord,
    sessions: &[SessionRecord],
) -> SessionResult<DeanonymizeReport> {
    let mut report = DeanonymizeReport::default();
    let anon_dir = project_dir.join(SessionMetadata::new(project_id, &subject.anon_id, "", None).subject_dir_name());
    let real_dir = project_dir.join(SessionMetadata::new(project_id, &subject.patient_id, "", None).subject_dir_name());

    if !anon_dir.exists() {
        warn!(
            "No anonymized directory {:?} for patient {}; skipping",
            anon_dir, subject.patient_id
        );
        return Ok(report);
    }
    if real_dir.exists() {
        return Err(SessionError::OutputExists(real_dir));
    }

    let shift = subject.date_shift_days.unwrap_or(0);
    for session in sessions {
        let anon_meta = SessionMetadata::new(project_id, &subject.anon_id, &session.session_id, None);
        let real_meta = SessionMetadata::new(project_id, &subject.patient_id, &session.session_id, None);
        let session_dir = anon_dir.join(anon_meta.session_dir_name());
        if !session_dir.is_dir() {
            warn!("Session directory {:?} missing; skipping", session_dir);
            continue;
        }

        let anon_prefix = anon_meta.prefix();
        let real_prefix = real_meta.prefix();
        for record in record_files(&session_dir)? {
            patch_record(&record, |value| {
                restore_record(value, &real_meta, session, shift, &anon_prefix, &real_prefix)
            })?;
        }
        for dir in [session_dir.clone(), session_dir.join("nii"), session_dir.join("logs")] {
            report.files_renamed += rename_prefixed(&dir, &anon_prefix, &real_prefix)?;
        }
        report.sessions += 1;
    }

    fs::rename(&anon_dir, &real_dir)?;
    info!(
        "Restored {} -> {}",
        anon_dir.display(),
        real_dir.display()
    );
    report.subjects = 1;
    Ok(report)
}

/// Session records and sidecars: every JSON file at the session root or in `nii/`
/// carrying a `Metadata` block.
fn record_files(session_dir: &Path) -> SessionResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for dir in [session_dir.to_path_buf(), session_dir.join("nii")] {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let text = fs::read_to_string(&path)?;
                if serde_json::from_str::<Value>(&text)
                    .map(|v| v.get("Metadata").is_some())
                    .unwrap_or(false)
                {
                    files.push(path);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

fn restore_record(
    value: &mut Value,
    real: &SessionMetadata,
    session: &SessionRecord,
    shift: i64,
    anon_prefix: &str,
    real_prefix: &str,
) {
    if let Some(meta) = value.get_mut("Metadata").and_then(Value::as_object_mut) {
        meta.insert("SubjectID".into(), Value::String(real.subject_id.clone()));
    }
    if let Some(obj) = value.as_object_mut() {
        obj.insert("RemoveIdentifiers".into(), Value::Bool(false));
    }
    if let Some(series) = value.get_mut("SeriesInfo") {
        restore_series(series, session, shift, anon_prefix, real_prefix);
    }
    if let Some(list) = value.get_mut("SeriesList").and_then(Value::as_array_mut) {
        for series in list {
            restore_series(series, session, shift, anon_prefix, real_prefix);
        }
    }
}

fn restore_series(
    series: &mut Value,
    session: &SessionRecord,
    shift: i64,
    anon_prefix: &str,
    real_prefix: &str,
) {
    let Some(obj) = series.as_object_mut() else {
        return;
    };
    let optional = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);

    if let Some(intake) = &session.source_path {
        obj.insert("IntakePath".into(), Value::String(intake.clone()));
    }
    // Only values hashed from the recorded institution can be restored; absent stays absent.
    if let Some(original) = &session.institution_name {
        let recorded = obj.get("InstitutionName").and_then(Value::as_str);
        if recorded == Some(hash_identifier(original).as_str()) {
            obj.insert("InstitutionName".into(), Value::String(original.clone()));
        }
    }
    obj.insert("StudyUID".into(), optional(&session.original_study_uid));
    if let Some(restored) = obj
        .get("AcqDateTime")
        .and_then(Value::as_str)
        .and_then(|dt| shift_date(dt, -shift))
    {
        obj.insert("AcqDateTime".into(), Value::String(restored));
    }
    if let Some(restored) = obj
        .get("NiftiName")
        .and_then(Value::as_str)
        .and_then(|name| name.strip_prefix(anon_prefix))
        .map(|rest| format!("{}{}", real_prefix, rest))
    {
        obj.insert("NiftiName".into(), Value::String(restored));
    }
}

/// Renames `<anon_prefix>…` entries of `dir` to `<real_prefix>…`, leaving existing targets alone.
fn rename_prefixed(dir: &Path, anon_prefix: &str, real_prefix: &str) -> SessionResult<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut renamed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(rest) = file_name.to_str().and_then(|n| n.strip_prefix(anon_prefix)) else {
            continue;
        };
        let target = dir.join(format!("{}{}", real_prefix, rest));
        if target.exists() {
            warn!("{:?} already exists; leaving {:?}", target, entry.path());
            continue;
        }
        fs::rename(entry.path(), target)?;
        renamed += 1;
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn subject() -> SubjectRecord {
        SubjectRecord {
            anon_id: "A3F7B2C1D4E5".into(),
            patient_id: "12345".into(),
            patient_name: None,
            patient_birth_date: None,
            patient_sex: None,
            date_shift_days: Some(10),
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn session() -> SessionRecord {
        SessionRecord {
            anon_id: "A3F7B2C1D4E5".into(),
            session_number: 1,
            session_id: "1".into(),
            source_path: Some("/incoming/patient-a".into()),
            original_study_uid: Some("1.2.840.1".into()),
            anon_study_uid: Some("2.25.7".into()),
            institution_name: Some("General Hospital".into()),
            converted_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn restores_names_prefixes_and_fields() {
        let dir = tempdir().expect("tmpdir");
        let project_dir = dir.path().join("study");
        let session_dir = project_dir.join("STUDY-A3F7B2C1D4E5").join("1");
        fs::create_dir_all(session_dir.join("nii")).unwrap();
        fs::create_dir_all(session_dir.join("logs")).unwrap();

        let series = json!({
            "SourcePath": "dcm/0002-1CD3F9C4A250",
            "InstitutionName": hash_identifier("General Hospital"),
            "StudyUID": "2.25.7",
            "AcqDateTime": "2024-01-15 08:00:00",
            "NiftiName": "STUDY-A3F7B2C1D4E5_1_BRAIN-T1"
        });
        let metadata = json!({"ProjectID": "STUDY", "SubjectID": "A3F7B2C1D4E5", "SessionID": "1", "SiteID": null});
        fs::write(
            session_dir.join("STUDY-A3F7B2C1D4E5_1_UnconvertedInfo.json"),
            json!({
                "Metadata": metadata,
                "RemoveIdentifiers": true,
                "SeriesList": [series, {"SourcePath": "dcm/0003-9A0B", "InstitutionName": null, "NiftiName": null}]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            session_dir.join("nii").join("STUDY-A3F7B2C1D4E5_1_BRAIN-T1.json"),
            json!({"Metadata": metadata, "RemoveIdentifiers": true, "SeriesInfo": series}).to_string(),
        )
        .unwrap();
        fs::write(session_dir.join("nii").join("STUDY-A3F7B2C1D4E5_1_BRAIN-T1.nii.gz"), "img").unwrap();
        fs::write(session_dir.join("logs").join("STUDY-A3F7B2C1D4E5_1_BRAIN-T1.log"), "log").unwrap();

        let report = deanonymize_subject(&project_dir, "study", &subject(), &[session()]).unwrap();
        assert_eq!(report.sessions, 1);
        assert_eq!(report.files_renamed, 4);

        let restored = project_dir.join("STUDY-12345").join("1");
        assert!(!project_dir.join("STUDY-A3F7B2C1D4E5").exists());
        assert!(restored.join("nii").join("STUDY-12345_1_BRAIN-T1.nii.gz").exists());
        assert!(restored.join("logs").join("STUDY-12345_1_BRAIN-T1.log").exists());

        let sidecar: Value = serde_json::from_str(
            &fs::read_to_string(restored.join("nii").join("STUDY-12345_1_BRAIN-T1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar["Metadata"]["SubjectID"], "12345");
        assert_eq!(sidecar["RemoveIdentifiers"], false);
        assert_eq!(sidecar["SeriesInfo"]["SourcePath"], "dcm/0002-1CD3F9C4A250");
        assert_eq!(sidecar["SeriesInfo"]["IntakePath"], "/incoming/patient-a");
        assert_eq!(sidecar["SeriesInfo"]["InstitutionName"], "General Hospital");
        assert_eq!(sidecar["SeriesInfo"]["StudyUID"], "1.2.840.1");
        assert_eq!(sidecar["SeriesInfo"]["AcqDateTime"], "2024-01-05 08:00:00");
        assert_eq!(sidecar["SeriesInfo"]["NiftiName"], "STUDY-12345_1_BRAIN-T1");

        let info: Value = serde_json::from_str(
            &fs::read_to_string(restored.join("STUDY-12345_1_UnconvertedInfo.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(info["SeriesList"][0]["StudyUID"], "1.2.840.1");
        assert_eq!(info["SeriesList"][1]["InstitutionName"], Value::Null);
    }

    #[test]
    fn existing_real_directory_is_not_overwritten() {
        let dir = tempdir().expect("tmpdir");
        let project_dir = dir.path().join("study");
        fs::create_dir_all(project_dir.join("STUDY-A3F7B2C1D4E5").join("1")).unwrap();
        fs::create_dir_all(project_dir.join("STUDY-12345")).unwrap();
        assert!(matches!(
            deanonymize_subject(&project_dir, "study", &subject(), &[session()]),
            Err(SessionError::OutputExists(_))
        ));
        assert!(project_dir.join("STUDY-A3F7B2C1D4E5").exists());
    }
}
