//
// models.rs
// radifox
//
// Defines the serializable session, series and provenance records written next to converted images.
//
// Thales Matheus Mendonça Santos - October 2026

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::naming::lookup::LookupRow;
use crate::naming::{Name, Override, NAMING_VERSION};

/// Identifies one session in the output tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(rename = "ProjectID")]
    pub project_id: String,
    #[serde(rename = "SubjectID")]
    pub subject_id: String,
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "SiteID")]
    pub site_id: Option<String>,
    /// Set when `--safe` placed this conversion next to an existing session.
    #[serde(rename = "AttemptNum", default, skip_serializing_if = "Option::is_none")]
    pub attempt_num: Option<u32>,
}

impl SessionMetadata {
    pub fn new(
        project_id: &str,
        subject_id: &str,
        session_id: &str,
        site_id: Option<&str>,
    ) -> Self {
        Self {
            project_id: project_id.to_uppercase(),
            subject_id: subject_id.to_uppercase(),
            session_id: session_id.to_string(),
            site_id: site_id.map(|s| s.to_string()),
            attempt_num: None,
        }
    }

    pub fn project_dir_name(&self) -> String {
        self.project_id.to_lowercase()
    }

    pub fn subject_dir_name(&self) -> String {
        format!("{}-{}", self.project_id, self.subject_id)
    }

    /// `<session>` or `<session>-<attempt>`.
    pub fn session_dir_name(&self) -> String {
        match self.attempt_num {
            Some(attempt) => format!("{}-{}", self.session_id, attempt),
            None => self.session_id.clone(),
        }
    }

    /// `<project>/<PROJECT>-<SUBJECT>/<session>` relative to the output root.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(self.project_dir_name())
            .join(self.subject_dir_name())
            .join(self.session_dir_name())
    }

    /// File-name prefix shared by every artifact of the session.
    pub fn prefix(&self) -> String {
        format!("{}_{}", self.subject_dir_name(), self.session_id)
    }
}

/// Patient-level attributes used for anonymization; never written to sidecars.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientIdentity {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub patient_birth_date: Option<String>,
    pub patient_sex: Option<String>,
    pub study_uid: Option<String>,
    pub institution_name: Option<String>,
}

/// Header fields of one series needed for naming and provenance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeriesMetadata {
    #[serde(rename = "SeriesUID")]
    pub series_uid: Option<String>,
    #[serde(rename = "StudyUID")]
    pub study_uid: Option<String>,
    pub series_number: Option<i64>,
    pub series_description: Option<String>,
    pub institution_name: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_model: Option<String>,
    pub magnetic_field_strength: Option<f64>,
    pub acq_date_time: Option<String>,
    pub modality: Option<String>,
    pub image_type: Vec<String>,
    pub scanning_sequence: Vec<String>,
    pub sequence_variant: Vec<String>,
    #[serde(rename = "MRAcquisitionType")]
    pub mr_acquisition_type: Option<String>,
    pub sequence_name: Option<String>,
    pub repetition_time: Option<f64>,
    pub echo_time: Option<f64>,
    pub inversion_time: Option<f64>,
    pub flip_angle: Option<f64>,
    pub echo_train_length: Option<f64>,
    pub slice_thickness: Option<f64>,
    pub image_orientation_patient: Vec<f64>,
    pub contrast_agent: Option<String>,
    pub body_part_examined: Option<String>,
    pub number_of_frames: Option<i64>,
}

impl SeriesMetadata {
    pub fn is_multiframe(&self) -> bool {
        self.number_of_frames.unwrap_or(1) > 1
    }
}

/// Per-series provenance entry (`SeriesInfo` in sidecars, element of `SeriesList`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeriesInfo {
    #[serde(flatten)]
    pub metadata: SeriesMetadata,
    pub multi_frame: bool,
    pub num_files: usize,
    /// `dcm/`-relative series key; carries no identifiers, so it is kept when anonymized.
    pub source_path: String,
    /// Original intake directory, written back by de-anonymization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake_path: Option<String>,
    pub source_hash: String,
    pub convert_image: bool,
    pub error_code: Option<String>,
    pub exclude_reason: Option<String>,
    pub predicted_name: Option<Name>,
    pub lookup_name: Option<Override>,
    pub manual_name: Option<Override>,
    pub nifti_name: Option<String>,
    pub nifti_created: bool,
    pub nifti_hash: Option<String>,
    pub conversion_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub radifox: String,
    pub converter: Option<String>,
}

impl VersionInfo {
    pub fn current(converter: Option<String>) -> Self {
        Self {
            radifox: NAMING_VERSION.to_string(),
            converter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LookupTableRecord {
    pub lookup_path: Option<String>,
    pub lookup_dict: Vec<LookupRow>,
}

/// Values supplied on the command line that win over the DICOM headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManualArgs {
    pub magnetic_field_strength: Option<f64>,
    pub institution_name: Option<String>,
}

/// Sidecar written next to every converted image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SidecarRecord {
    #[serde(rename = "__version__")]
    pub version: VersionInfo,
    pub input_hash: String,
    pub lookup_table: LookupTableRecord,
    pub manual_names: BTreeMap<String, String>,
    pub metadata: SessionMetadata,
    pub remove_identifiers: bool,
    pub series_info: SeriesInfo,
}

/// Session-wide record (`<prefix>_UnconvertedInfo.json`) listing every discovered series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionInfo {
    #[serde(rename = "__version__")]
    pub version: VersionInfo,
    pub input_hash: String,
    pub lookup_table: LookupTableRecord,
    pub manual_names: BTreeMap<String, String>,
    pub manual_args: ManualArgs,
    pub metadata: SessionMetadata,
    pub remove_identifiers: bool,
    pub series_list: Vec<SeriesInfo>,
}

impl SessionInfo {
    pub fn file_name(metadata: &SessionMetadata) -> String {
        format!("{}_UnconvertedInfo.json", metadata.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_project_subject_session() {
        let meta = SessionMetadata::new("Study", "a3f7b2c1d4e5", "2", None);
        assert_eq!(
            meta.relative_dir(),
            PathBuf::from("study/STUDY-A3F7B2C1D4E5/2")
        );
        assert_eq!(meta.prefix(), "STUDY-A3F7B2C1D4E5_2");

        let retry = SessionMetadata {
            attempt_num: Some(2),
            ..meta
        };
        assert_eq!(
            retry.relative_dir(),
            PathBuf::from("study/STUDY-A3F7B2C1D4E5/2-2")
        );
        assert_eq!(retry.prefix(), "STUDY-A3F7B2C1D4E5_2");
    }

    #[test]
    fn series_metadata_uses_dicom_style_keys() {
        let meta = SeriesMetadata {
            series_uid: Some("1.2.3".into()),
            mr_acquisition_type: Some("3D".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["SeriesUID"], "1.2.3");
        assert_eq!(value["MRAcquisitionType"], "3D");
        assert!(value.get("AcqDateTime").is_some());
    }
}
