//
// update.rs
// radifox
//
// Re-applies naming to an existing session when the naming version or an override layer changed.
//
// Thales Matheus Mendonça Santos - October 2026

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{default_lut_path, Settings};
use crate::context::StageContext;
use crate::error::{LedgerError, SessionError, SessionResult};
use crate::ledger::{session_state, SessionLedger, SessionState};
use crate::models::VersionInfo;
use crate::naming::lookup::{Institution, LookupTable};
use crate::naming::manual::ManualNames;
use crate::naming::resolver::{LayeredResolver, NameRegistry, Resolution, Resolver, SeriesQuery};
use crate::naming::NAMING_VERSION;
use crate::provenance::{find_session_info, ProvenanceRecorder};
use crate::storage::OutputTree;

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Look-up table to use instead of the project default.
    pub lut_path: Option<PathBuf>,
    /// Re-apply even when the ledger says the session is current.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing changed; nothing was written.
    Skipped,
    Updated { renamed: usize },
    /// Some series could not be renamed; the session record and ledger were left as they were.
    Partial { renamed: usize, failed: Vec<String> },
}

impl UpdateOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, UpdateOutcome::Partial { .. })
    }
}

struct PlannedRename {
    index: usize,
    old_stem: String,
    new_stem: String,
    resolution: Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Temporary,
    Old,
    Final,
}

fn temp_stem(new_stem: &str) -> String {
    format!(".{}.renaming", new_stem)
}

/// Image, sidecar and converter log sharing one stem.
fn artifacts(session_dir: &Path, stem: &str) -> [PathBuf; 3] {
    [
        session_dir.join("nii").join(format!("{}.nii.gz", stem)),
        session_dir.join("nii").join(format!("{}.json", stem)),
        session_dir.join("logs").join(format!("{}.log", stem)),
    ]
}

fn move_artifacts(session_dir: &Path, from: &str, to: &str) -> SessionResult<()> {
    for (src, dst) in artifacts(session_dir, from)
        .iter()
        .zip(artifacts(session_dir, to).iter())
    {
        if src.exists() {
            fs::rename(src, dst)?;
        }
    }
    Ok(())
}

/// Where the image for `plan` currently is. A re-run after an interrupted update
/// finds it under the temporary, old or new stem, checked in that order.
fn locate(session_dir: &Path, plan: &PlannedRename) -> Option<Location> {
    let image = |stem: &str| artifacts(session_dir, stem)[0].exists();
    if image(&temp_stem(&plan.new_stem)) {
        Some(Location::Temporary)
    } else if image(&plan.old_stem) {
        Some(Location::Old)
    } else if image(&plan.new_stem) {
        Some(Location::Final)
    } else {
        None
    }
}

/// Brings the session in `session_dir` in line with the current naming inputs.
pub fn update_session(
    session_dir: &Path,
    settings: &Settings,
    options: &UpdateOptions,
) -> SessionResult<UpdateOutcome> {
    let (_, info) = find_session_info(session_dir)?;
    let meta = info.metadata.clone();
    let ctx = StageContext::session(&meta.prefix());

    let tree = OutputTree::from_session_dir(session_dir).ok_or_else(|| {
        SessionError::Invalid(format!("{:?} is not inside an output tree", session_dir))
    })?;
    let lut_path = options
        .lut_path
        .clone()
        .unwrap_or_else(|| default_lut_path(tree.root(), &meta.project_id));
    let lookup = LookupTable::load(&lut_path, &meta.project_id, meta.site_id.as_deref())?;
    let manual = ManualNames::load(&ManualNames::file_path(session_dir, &meta))?;
    let current = SessionLedger::current(&lookup, &manual);

    match session_state(session_dir, &meta, &current)? {
        SessionState::UpToDate if !options.force => {
            ctx.info("No action required: naming version, look-up table and manual names match");
            return Ok(UpdateOutcome::Skipped);
        }
        SessionState::UpToDate => ctx.info("naming inputs unchanged; forced update"),
        SessionState::StaleNaming => ctx.info("naming inputs changed; updating"),
        SessionState::Converted => ctx.warn(&format!(
            "{}; treating session as stale",
            LedgerError::Missing(SessionLedger::file_path(session_dir, &meta))
        )),
        SessionState::Unconverted => {
            return Err(SessionError::Invalid(format!(
                "session record in {:?} does not match its metadata",
                session_dir
            )))
        }
    }

    let resolver = LayeredResolver::new(lookup, manual, settings.naming.extras_mode);
    let recorder = ProvenanceRecorder::new(
        VersionInfo {
            radifox: NAMING_VERSION.to_string(),
            converter: info.version.converter.clone(),
        },
        info.input_hash.clone(),
        resolver.lookup(),
        meta.clone(),
        info.remove_identifiers,
        info.manual_args.clone(),
    );

    // Names are re-resolved in recorded order so collision suffixes match a fresh conversion.
    let mut series_list = info.series_list.clone();
    let mut registry = NameRegistry::default();
    let mut planned = Vec::new();
    for (index, series) in series_list.iter_mut().enumerate() {
        let Some(predicted) = series.predicted_name.clone() else {
            continue;
        };
        let series_ctx = ctx.series(&series.source_path);
        let resolution = resolver.resolve(
            &series_ctx,
            &predicted,
            &SeriesQuery {
                description: series.metadata.series_description.as_deref(),
                institution: series.metadata.institution_name.as_deref().map(|name| {
                    if info.remove_identifiers {
                        Institution::Hashed(name)
                    } else {
                        Institution::Plain(name)
                    }
                }),
                source_path: Some(series.source_path.as_str()),
            },
        );
        let new_stem = recorder.stem(&registry.claim(resolution.name.clone()).render());
        series.lookup_name = resolution.lookup_name.clone();
        series.manual_name = resolution.manual_name.clone();
        let old_stem = series
            .nifti_name
            .replace(new_stem.clone())
            .unwrap_or_else(|| new_stem.clone());
        if series.nifti_created {
            planned.push(PlannedRename {
                index,
                old_stem,
                new_stem,
                resolution,
            });
        }
    }

    // Phase one moves every renamed series out of the way so swapped names cannot collide.
    let mut failed = Vec::new();
    let mut ready = Vec::new();
    for plan in planned {
        let result = match locate(session_dir, &plan) {
            None => Err(SessionError::Invalid(format!(
                "image for {} not found",
                plan.old_stem
            ))),
            Some(Location::Old) if plan.old_stem != plan.new_stem => {
                move_artifacts(session_dir, &plan.old_stem, &temp_stem(&plan.new_stem))
                    .map(|_| Location::Temporary)
            }
            Some(location) => Ok(location),
        };
        match result {
            Ok(location) => ready.push((plan, location)),
            Err(err) => {
                ctx.warn(&format!("cannot rename {}: {}", plan.old_stem, err));
                failed.push(plan.old_stem);
            }
        }
    }

    let nii_dir = session_dir.join("nii");
    let mut renamed = 0;
    for (plan, location) in ready {
        let series = &series_list[plan.index];
        let result = (|| {
            if location == Location::Temporary {
                move_artifacts(session_dir, &temp_stem(&plan.new_stem), &plan.new_stem)?;
            }
            recorder.write_sidecar(
                &nii_dir,
                series,
                &plan.resolution.lookup_rows,
                &plan.resolution.manual_entries,
            )
        })();
        match result {
            Ok(_) => {
                if plan.old_stem != plan.new_stem {
                    ctx.info(&format!("renamed {} -> {}", plan.old_stem, plan.new_stem));
                    renamed += 1;
                }
            }
            Err(err) => {
                ctx.warn(&format!("cannot finish {}: {}", plan.new_stem, err));
                failed.push(plan.old_stem);
            }
        }
    }

    if !failed.is_empty() {
        return Ok(UpdateOutcome::Partial { renamed, failed });
    }

    let info = recorder.session_info(resolver.lookup(), resolver.manual(), series_list);
    recorder.write_session_info(session_dir, &info)?;
    current.save(&SessionLedger::file_path(session_dir, &meta))?;
    Ok(UpdateOutcome::Updated { renamed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tempfile::{tempdir, TempDir};

    use crate::models::{ManualArgs, SeriesInfo, SeriesMetadata, SessionMetadata};
    use crate::naming::{Name, SLOT_COUNT};
    use crate::provenance::read_json;

    fn name(parts: [&str; 2]) -> Name {
        let mut slots: [Option<String>; SLOT_COUNT] = Default::default();
        slots[0] = Some(parts[0].to_string());
        slots[1] = Some(parts[1].to_string());
        Name::new(slots, Vec::new())
    }

    fn series(source: &str, predicted: Name, stem: &str) -> SeriesInfo {
        SeriesInfo {
            metadata: SeriesMetadata {
                series_uid: Some(format!("1.2.{}", source.len())),
                series_description: Some(source.to_uppercase()),
                ..Default::default()
            },
            multi_frame: false,
            num_files: 1,
            source_path: format!("dcm/{}", source),
            intake_path: None,
            source_hash: "h".into(),
            convert_image: true,
            error_code: None,
            exclude_reason: None,
            predicted_name: Some(predicted),
            lookup_name: None,
            manual_name: None,
            nifti_name: Some(stem.to_string()),
            nifti_created: true,
            nifti_hash: None,
            conversion_error: None,
        }
    }

    /// `<root>/p/P-S/1` with two converted series and an up-to-date ledger.
    fn converted_session() -> (TempDir, PathBuf, SessionMetadata) {
        let root = tempdir().expect("tmpdir");
        let meta = SessionMetadata::new("P", "S", "1", None);
        let session_dir = root.path().join(meta.relative_dir());
        fs::create_dir_all(session_dir.join("nii")).unwrap();
        fs::create_dir_all(session_dir.join("logs")).unwrap();

        let lookup = LookupTable::empty();
        let manual = ManualNames::default();
        let recorder = ProvenanceRecorder::new(
            VersionInfo::current(None),
            "input".into(),
            &lookup,
            meta.clone(),
            false,
            ManualArgs::default(),
        );
        let list = vec![
            series("a", name(["BRAIN", "T1"]), "P-S_1_BRAIN-T1"),
            series("b", name(["BRAIN", "T2"]), "P-S_1_BRAIN-T2"),
        ];
        for (item, content) in list.iter().zip(["image-a", "image-b"]) {
            let stem = item.nifti_name.as_deref().unwrap();
            fs::write(session_dir.join("nii").join(format!("{}.nii.gz", stem)), content).unwrap();
            fs::write(session_dir.join("logs").join(format!("{}.log", stem)), "log").unwrap();
            recorder
                .write_sidecar(&session_dir.join("nii"), item, &[], &BTreeMap::new())
                .unwrap();
        }
        let info = recorder.session_info(&lookup, &manual, list);
        recorder.write_session_info(&session_dir, &info).unwrap();
        SessionLedger::current(&lookup, &manual)
            .save(&SessionLedger::file_path(&session_dir, &meta))
            .unwrap();
        (root, session_dir, meta)
    }

    fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| (e.path().to_path_buf(), fs::read(e.path()).unwrap()))
            .collect()
    }

    fn write_manual(session_dir: &Path, meta: &SessionMetadata, entries: &[(&str, &str)]) {
        let map: BTreeMap<&str, &str> = entries.iter().cloned().collect();
        fs::write(
            ManualNames::file_path(session_dir, meta),
            serde_json::to_string(&map).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn unchanged_inputs_skip_without_writing() {
        let (root, session_dir, _) = converted_session();
        let before = snapshot(root.path());
        let outcome =
            update_session(&session_dir, &Settings::default(), &UpdateOptions::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Skipped);
        assert_eq!(snapshot(root.path()), before);
        assert!(!root.path().join("p").join("p-lut.csv").exists());
    }

    #[test]
    fn manual_change_renames_image_sidecar_and_log() {
        let (_root, session_dir, meta) = converted_session();
        write_manual(&session_dir, &meta, &[("dcm/a", "None-FLAIR")]);

        let outcome =
            update_session(&session_dir, &Settings::default(), &UpdateOptions::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { renamed: 1 });

        let nii = session_dir.join("nii");
        assert_eq!(fs::read_to_string(nii.join("P-S_1_BRAIN-FLAIR.nii.gz")).unwrap(), "image-a");
        assert!(!nii.join("P-S_1_BRAIN-T1.nii.gz").exists());
        assert!(!nii.join("P-S_1_BRAIN-T1.json").exists());
        assert!(session_dir.join("logs").join("P-S_1_BRAIN-FLAIR.log").exists());

        let sidecar: serde_json::Value = read_json(&nii.join("P-S_1_BRAIN-FLAIR.json")).unwrap();
        assert_eq!(sidecar["SeriesInfo"]["NiftiName"], "P-S_1_BRAIN-FLAIR");
        assert_eq!(sidecar["ManualNames"]["dcm/a"], "None-FLAIR");

        let (_, info) = find_session_info(&session_dir).unwrap();
        assert_eq!(
            info.series_list[0].nifti_name.as_deref(),
            Some("P-S_1_BRAIN-FLAIR")
        );

        // Second run sees the advanced ledger.
        let again =
            update_session(&session_dir, &Settings::default(), &UpdateOptions::default()).unwrap();
        assert_eq!(again, UpdateOutcome::Skipped);
    }

    #[test]
    fn swapped_names_do_not_clobber_each_other() {
        let (_root, session_dir, meta) = converted_session();
        write_manual(
            &session_dir,
            &meta,
            &[("dcm/a", "None-T2"), ("dcm/b", "None-T1")],
        );
        let outcome =
            update_session(&session_dir, &Settings::default(), &UpdateOptions::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { renamed: 2 });

        let nii = session_dir.join("nii");
        assert_eq!(fs::read_to_string(nii.join("P-S_1_BRAIN-T2.nii.gz")).unwrap(), "image-a");
        assert_eq!(fs::read_to_string(nii.join("P-S_1_BRAIN-T1.nii.gz")).unwrap(), "image-b");
    }

    #[test]
    fn interrupted_rename_is_completed_on_rerun() {
        let (_root, session_dir, meta) = converted_session();
        write_manual(&session_dir, &meta, &[("dcm/a", "None-PD")]);
        // Simulate a crash after the first phase.
        move_artifacts(&session_dir, "P-S_1_BRAIN-T1", &temp_stem("P-S_1_BRAIN-PD")).unwrap();

        let outcome =
            update_session(&session_dir, &Settings::default(), &UpdateOptions::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { renamed: 1 });
        assert!(session_dir.join("nii").join("P-S_1_BRAIN-PD.nii.gz").exists());
    }

    #[test]
    fn missing_image_leaves_session_record_untouched() {
        let (_root, session_dir, meta) = converted_session();
        write_manual(&session_dir, &meta, &[("dcm/b", "None-PD")]);
        fs::remove_file(session_dir.join("nii").join("P-S_1_BRAIN-T2.nii.gz")).unwrap();
        let ledger_before =
            fs::read(SessionLedger::file_path(&session_dir, &meta)).unwrap();

        let outcome =
            update_session(&session_dir, &Settings::default(), &UpdateOptions::default()).unwrap();
        assert!(!outcome.is_success());
        assert_eq!(
            fs::read(SessionLedger::file_path(&session_dir, &meta)).unwrap(),
            ledger_before
        );
    }

    #[test]
    fn missing_ledger_is_treated_as_stale() {
        let (_root, session_dir, meta) = converted_session();
        fs::remove_file(SessionLedger::file_path(&session_dir, &meta)).unwrap();
        let outcome =
            update_session(&session_dir, &Settings::default(), &UpdateOptions::default()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { renamed: 0 });
        assert!(SessionLedger::file_path(&session_dir, &meta).exists());
    }
}
