use crate::context::StageContext;
use crate::models::SeriesMetadata;
use crate::naming::{Name, SLOT_COUNT};

pub trait Predictor: Send + Sync {
    /// Must be a pure function of `metadata`: identical input, identical name.
    fn predict(&self, ctx: &StageContext, metadata: &SeriesMetadata) -> Name;
}

/// Rule-based predictor over sequence parameters and orientation.
#[derive(Debug, Clone, Default)]
pub struct RulePredictor;

impl Predictor for RulePredictor {
    fn predict(&self, ctx: &StageContext, metadata: &SeriesMetadata) -> Name {
        let mut slots: [Option<String>; SLOT_COUNT] = Default::default();
        slots[0] = Some(body_part(metadata).to_string());
        slots[1] = Some(modality(metadata).to_string());
        slots[2] = Some(technique(metadata).to_string());
        slots[3] = Some(plane(&metadata.image_orientation_patient).to_string());
        slots[4] = contrast(metadata).map(str::to_string);
        slots[5] = variant(metadata).map(str::to_string);
        let name = Name::new(slots, Vec::new());
        ctx.debug(&format!("predicted {}", name));
        name
    }
}

fn body_part(meta: &SeriesMetadata) -> &'static str {
    let part = meta
        .body_part_examined
        .as_deref()
        .unwrap_or_default()
        .to_uppercase()
        .replace(['-', ' ', '_'], "");
    match part.as_str() {
        "CSPINE" | "NECK" => "CSPINE",
        "TSPINE" => "TSPINE",
        "LSPINE" => "LSPINE",
        "SPINE" | "WHOLESPINE" => "SPINE",
        "ORBIT" | "ORBITS" => "ORBITS",
        _ => "BRAIN",
    }
}

fn modality(meta: &SeriesMetadata) -> &'static str {
    match meta.modality.as_deref() {
        Some("MR") | None => {}
        Some("CT") => return "CT",
        Some("PT") => return "PET",
        Some(_) => return "UNK",
    }

    let description = meta
        .series_description
        .as_deref()
        .unwrap_or_default()
        .to_uppercase();
    const KEYWORDS: &[(&str, &str)] = &[
        ("FLAIR", "FLAIR"),
        ("DTI", "DWI"),
        ("DWI", "DWI"),
        ("DIFF", "DWI"),
        ("SWI", "SWI"),
        ("SWAN", "SWI"),
        ("PD", "PD"),
        ("T1", "T1"),
        ("MPRAGE", "T1"),
        ("T2", "T2"),
    ];
    if let Some((_, value)) = KEYWORDS.iter().find(|(k, _)| description.contains(k)) {
        return value;
    }

    let tr = meta.repetition_time.unwrap_or(0.0);
    let te = meta.echo_time.unwrap_or(0.0);
    let ti = meta.inversion_time.unwrap_or(0.0);
    let inversion = meta.scanning_sequence.iter().any(|s| s == "IR") || ti > 0.0;

    if inversion && ti >= 1500.0 {
        "FLAIR"
    } else if inversion && ti > 0.0 {
        "T1"
    } else if te == 0.0 && tr == 0.0 {
        "UNK"
    } else if tr < 1000.0 && te < 30.0 {
        "T1"
    } else if te >= 60.0 {
        "T2"
    } else if tr >= 1500.0 && te < 60.0 {
        "PD"
    } else {
        "UNK"
    }
}

fn technique(meta: &SeriesMetadata) -> &'static str {
    let has = |list: &[String], value: &str| list.iter().any(|s| s == value);
    let seq = &meta.scanning_sequence;
    let var = &meta.sequence_variant;
    let fast = meta.echo_train_length.unwrap_or(1.0) > 1.0;

    if has(seq, "EP") {
        "EPI"
    } else if has(seq, "IR") && has(seq, "GR") {
        if has(var, "SP") {
            "IRSPGR"
        } else {
            "IRGRE"
        }
    } else if has(seq, "IR") {
        if fast {
            "IRFSE"
        } else {
            "IRSE"
        }
    } else if has(seq, "SE") {
        if fast {
            "FSE"
        } else {
            "SE"
        }
    } else if has(seq, "GR") {
        if has(var, "SP") {
            "SPGR"
        } else {
            "GRE"
        }
    } else {
        "UNK"
    }
}

/// Acquisition plane from the dominant component of the slice normal.
fn plane(orientation: &[f64]) -> &'static str {
    if orientation.len() != 6 {
        return "UNK";
    }
    let row = [orientation[0], orientation[1], orientation[2]];
    let col = [orientation[3], orientation[4], orientation[5]];
    let normal = [
        (row[1] * col[2] - row[2] * col[1]).abs(),
        (row[2] * col[0] - row[0] * col[2]).abs(),
        (row[0] * col[1] - row[1] * col[0]).abs(),
    ];
    if normal[0] >= normal[1] && normal[0] >= normal[2] {
        "SAG"
    } else if normal[1] >= normal[2] {
        "COR"
    } else {
        "AX"
    }
}

fn contrast(meta: &SeriesMetadata) -> Option<&'static str> {
    meta.contrast_agent
        .as_deref()
        .filter(|agent| !agent.eq_ignore_ascii_case("none") && !agent.eq_ignore_ascii_case("no"))
        .map(|_| "POST")
}

fn variant(meta: &SeriesMetadata) -> Option<&'static str> {
    if meta.mr_acquisition_type.as_deref() == Some("3D") {
        Some("3D")
    } else if meta.is_multiframe() {
        Some("MF")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn axial_t2() -> SeriesMetadata {
        SeriesMetadata {
            series_uid: Some("1.2.3".into()),
            modality: Some("MR".into()),
            series_description: Some("Ax dual echo".into()),
            scanning_sequence: strings(&["SE"]),
            sequence_variant: strings(&["SK"]),
            echo_train_length: Some(16.0),
            repetition_time: Some(4000.0),
            echo_time: Some(100.0),
            image_orientation_patient: vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            ..Default::default()
        }
    }

    #[test]
    fn axial_fast_spin_echo_t2() {
        let name = RulePredictor.predict(&StageContext::default(), &axial_t2());
        assert_eq!(name.render(), "BRAIN-T2-FSE-AX");
        assert_eq!(name.slots()[4], None);
        assert_eq!(name.slots()[5], None);
    }

    #[test]
    fn sagittal_3d_post_contrast_spgr() {
        let meta = SeriesMetadata {
            scanning_sequence: strings(&["IR", "GR"]),
            sequence_variant: strings(&["SP", "MP"]),
            echo_train_length: None,
            repetition_time: Some(8.0),
            echo_time: Some(3.0),
            inversion_time: Some(450.0),
            mr_acquisition_type: Some("3D".into()),
            contrast_agent: Some("Gadavist".into()),
            series_description: Some("sag bravo".into()),
            image_orientation_patient: vec![0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
            ..axial_t2()
        };
        let name = RulePredictor.predict(&StageContext::default(), &meta);
        assert_eq!(name.render(), "BRAIN-T1-IRSPGR-SAG-POST-3D");
    }

    #[test]
    fn prediction_is_deterministic() {
        let meta = axial_t2();
        let a = RulePredictor.predict(&StageContext::default(), &meta);
        let b = RulePredictor.predict(&StageContext::default(), &meta);
        assert_eq!(a, b);
    }

    #[test]
    fn coronal_and_unknown_orientation() {
        assert_eq!(plane(&[1.0, 0.0, 0.0, 0.0, 0.0, -1.0]), "COR");
        assert_eq!(plane(&[]), "UNK");
    }

    #[test]
    fn flair_from_inversion_time() {
        let meta = SeriesMetadata {
            series_description: Some("ax dark fluid".into()),
            scanning_sequence: strings(&["IR", "SE"]),
            inversion_time: Some(2500.0),
            ..axial_t2()
        };
        assert_eq!(modality(&meta), "FLAIR");
        assert_eq!(technique(&meta), "IRFSE");
    }
}
