use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use dicom::core::Tag;
use dicom::object::{DefaultDicomObject, OpenFileOptions};
use tracing::debug;
use walkdir::WalkDir;

use crate::dicom_access::ElementAccess;
use crate::models::{PatientIdentity, SeriesMetadata};
use crate::storage::short_hash;

const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
const PATIENT_BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
const PATIENT_SEX: Tag = Tag(0x0010, 0x0040);
const IMAGE_TYPE: Tag = Tag(0x0008, 0x0008);
const STUDY_DATE: Tag = Tag(0x0008, 0x0020);
const SERIES_DATE: Tag = Tag(0x0008, 0x0021);
const ACQUISITION_DATE: Tag = Tag(0x0008, 0x0022);
const ACQUISITION_DATE_TIME: Tag = Tag(0x0008, 0x002A);
const STUDY_TIME: Tag = Tag(0x0008, 0x0030);
const SERIES_TIME: Tag = Tag(0x0008, 0x0031);
const ACQUISITION_TIME: Tag = Tag(0x0008, 0x0032);
const MODALITY: Tag = Tag(0x0008, 0x0060);
const MANUFACTURER: Tag = Tag(0x0008, 0x0070);
const INSTITUTION_NAME: Tag = Tag(0x0008, 0x0080);
const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
const MANUFACTURER_MODEL: Tag = Tag(0x0008, 0x1090);
const CONTRAST_BOLUS_AGENT: Tag = Tag(0x0018, 0x0010);
const BODY_PART_EXAMINED: Tag = Tag(0x0018, 0x0015);
const SCANNING_SEQUENCE: Tag = Tag(0x0018, 0x0020);
const SEQUENCE_VARIANT: Tag = Tag(0x0018, 0x0021);
const MR_ACQUISITION_TYPE: Tag = Tag(0x0018, 0x0023);
const SEQUENCE_NAME: Tag = Tag(0x0018, 0x0024);
const SLICE_THICKNESS: Tag = Tag(0x0018, 0x0050);
const REPETITION_TIME: Tag = Tag(0x0018, 0x0080);
const ECHO_TIME: Tag = Tag(0x0018, 0x0081);
const INVERSION_TIME: Tag = Tag(0x0018, 0x0082);
const MAGNETIC_FIELD_STRENGTH: Tag = Tag(0x0018, 0x0087);
const ECHO_TRAIN_LENGTH: Tag = Tag(0x0018, 0x0091);
const FLIP_ANGLE: Tag = Tag(0x0018, 0x1314);
const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
const SERIES_NUMBER: Tag = Tag(0x0020, 0x0011);
const IMAGE_ORIENTATION_PATIENT: Tag = Tag(0x0020, 0x0037);
const NUMBER_OF_FRAMES: Tag = Tag(0x0028, 0x0008);
const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

/// Output format of every acquisition timestamp in the provenance records.
pub const ACQ_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Files of one series found under a source directory.
#[derive(Debug, Clone)]
pub struct DiscoveredSeries {
    pub files: Vec<PathBuf>,
    pub metadata: SeriesMetadata,
}

impl DiscoveredSeries {
    /// Directory name under `dcm/`; derived from hashes so it carries no identifiers.
    pub fn dir_name(&self) -> String {
        let key = self
            .metadata
            .series_uid
            .clone()
            .unwrap_or_else(|| self.fallback_key());
        format!(
            "{:04}-{}",
            self.metadata.series_number.unwrap_or(0).max(0),
            short_hash(&key)
        )
    }

    fn fallback_key(&self) -> String {
        self.files
            .first()
            .and_then(|f| f.parent())
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

/// Reads only the header of a DICOM file, stopping before pixel data.
pub fn read_header(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(PIXEL_DATA)
        .open_file(path)
        .with_context(|| format!("Falha ao abrir arquivo DICOM {:?}", path))
}

pub fn extract_patient_identity<T: ElementAccess>(obj: &T) -> PatientIdentity {
    PatientIdentity {
        patient_id: obj.element_str(PATIENT_ID),
        patient_name: obj.element_str(PATIENT_NAME),
        patient_birth_date: obj.element_str(PATIENT_BIRTH_DATE),
        patient_sex: obj.element_str(PATIENT_SEX),
        study_uid: obj.element_str(STUDY_INSTANCE_UID),
        institution_name: obj.element_str(INSTITUTION_NAME),
    }
}

pub fn extract_series_metadata<T: ElementAccess>(obj: &T) -> SeriesMetadata {
    SeriesMetadata {
        series_uid: obj.element_str(SERIES_INSTANCE_UID),
        study_uid: obj.element_str(STUDY_INSTANCE_UID),
        series_number: obj.element_f64(SERIES_NUMBER).map(|n| n as i64),
        series_description: obj.element_str(SERIES_DESCRIPTION),
        institution_name: obj.element_str(INSTITUTION_NAME),
        manufacturer: obj.element_str(MANUFACTURER),
        manufacturer_model: obj.element_str(MANUFACTURER_MODEL),
        magnetic_field_strength: obj.element_f64(MAGNETIC_FIELD_STRENGTH),
        acq_date_time: acquisition_datetime(obj),
        modality: obj.element_str(MODALITY),
        image_type: obj.element_values(IMAGE_TYPE),
        scanning_sequence: obj.element_values(SCANNING_SEQUENCE),
        sequence_variant: obj.element_values(SEQUENCE_VARIANT),
        mr_acquisition_type: obj.element_str(MR_ACQUISITION_TYPE),
        sequence_name: obj.element_str(SEQUENCE_NAME),
        repetition_time: obj.element_f64(REPETITION_TIME),
        echo_time: obj.element_f64(ECHO_TIME),
        inversion_time: obj.element_f64(INVERSION_TIME),
        flip_angle: obj.element_f64(FLIP_ANGLE),
        echo_train_length: obj.element_f64(ECHO_TRAIN_LENGTH),
        slice_thickness: obj.element_f64(SLICE_THICKNESS),
        image_orientation_patient: obj.element_f64s(IMAGE_ORIENTATION_PATIENT),
        contrast_agent: obj.element_str(CONTRAST_BOLUS_AGENT),
        body_part_examined: obj.element_str(BODY_PART_EXAMINED),
        number_of_frames: obj.element_f64(NUMBER_OF_FRAMES).map(|n| n as i64),
    }
}

/// First available of AcquisitionDateTime, Acquisition, Series or Study date/time pairs.
fn acquisition_datetime<T: ElementAccess>(obj: &T) -> Option<String> {
    if let Some(dt) = obj.element_str(ACQUISITION_DATE_TIME) {
        let (date, time) = if dt.is_char_boundary(8.min(dt.len())) {
            dt.split_at(8.min(dt.len()))
        } else {
            (dt.as_str(), "")
        };
        if let Some(formatted) = format_dicom_datetime(date, Some(time)) {
            return Some(formatted);
        }
    }
    [
        (ACQUISITION_DATE, ACQUISITION_TIME),
        (SERIES_DATE, SERIES_TIME),
        (STUDY_DATE, STUDY_TIME),
    ]
    .iter()
    .find_map(|(date, time)| {
        let date = obj.element_str(*date)?;
        format_dicom_datetime(&date, obj.element_str(*time).as_deref())
    })
}

/// Converts DICOM `DA` + optional `TM` into `YYYY-MM-DD HH:MM:SS`.
pub fn format_dicom_datetime(date: &str, time: Option<&str>) -> Option<String> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y%m%d").ok()?;
    let time = time
        .map(|t| t.trim())
        .filter(|t| t.len() >= 4 && t.is_ascii())
        .and_then(|t| {
            let hhmmss = t.get(..6).unwrap_or(t);
            let padded = format!("{:0<6}", hhmmss);
            NaiveTime::parse_from_str(&padded, "%H%M%S").ok()
        })
        .unwrap_or(NaiveTime::MIN);
    Some(
        NaiveDateTime::new(date, time)
            .format(ACQ_DATETIME_FORMAT)
            .to_string(),
    )
}

/// Walks `source` and groups every readable DICOM file by SeriesInstanceUID.
/// Files without a UID are grouped per directory so they are still reported.
pub fn discover_series(source: &Path) -> Result<Vec<DiscoveredSeries>> {
    let mut files: Vec<PathBuf> = WalkDir::new(source)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut groups: BTreeMap<String, DiscoveredSeries> = BTreeMap::new();
    for path in files {
        let obj = match read_header(&path) {
            Ok(obj) => obj,
            Err(err) => {
                debug!("Ignorando arquivo não DICOM {:?}: {}", path, err);
                continue;
            }
        };
        let metadata = extract_series_metadata(&obj);
        let key = match &metadata.series_uid {
            Some(uid) => uid.clone(),
            None => format!(
                "missing-uid:{}",
                path.parent().map(|p| p.display().to_string()).unwrap_or_default()
            ),
        };
        groups
            .entry(key)
            .or_insert_with(|| DiscoveredSeries {
                files: Vec::new(),
                metadata,
            })
            .files
            .push(path);
    }

    let mut series: Vec<DiscoveredSeries> = groups.into_values().collect();
    series.sort_by(|a, b| {
        (a.metadata.series_number, &a.metadata.series_uid)
            .cmp(&(b.metadata.series_number, &b.metadata.series_uid))
    });
    Ok(series)
}

/// First readable DICOM header below `directory`, in path order.
pub fn find_first_dicom(directory: &Path) -> Option<DefaultDicomObject> {
    let mut files: Vec<PathBuf> = WalkDir::new(directory)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files.iter().find_map(|path| read_header(path).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::object::InMemDicomObject;

    #[test]
    fn dicom_dates_are_normalised() {
        assert_eq!(
            format_dicom_datetime("20240131", Some("0930")).as_deref(),
            Some("2024-01-31 09:30:00")
        );
        assert_eq!(
            format_dicom_datetime("20240131", Some("093015.123")).as_deref(),
            Some("2024-01-31 09:30:15")
        );
        assert_eq!(
            format_dicom_datetime("20240131", None).as_deref(),
            Some("2024-01-31 00:00:00")
        );
        assert_eq!(format_dicom_datetime("2024", None), None);
    }

    #[test]
    fn non_ascii_times_do_not_panic() {
        assert_eq!(
            format_dicom_datetime("20240131", Some("09300é")).as_deref(),
            Some("2024-01-31 00:00:00")
        );

        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            ACQUISITION_DATE_TIME,
            VR::DT,
            PrimitiveValue::from("2024013é0930"),
        ));
        obj.put(DataElement::new(
            SERIES_DATE,
            VR::DA,
            PrimitiveValue::from("20240131"),
        ));
        assert_eq!(
            acquisition_datetime(&obj).as_deref(),
            Some("2024-01-31 00:00:00")
        );
    }
}
