//
// session.rs
// radifox
//
// Converts one DICOM source into a session directory: classify, name, convert, record, publish.
//
// Thales Matheus Mendonça Santos - October 2026

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::anonymize::AnonymizationPlan;
use crate::config::{default_lut_path, Settings};
use crate::context::StageContext;
use crate::converter::{ConversionJob, Converter, Dcm2NiixConverter};
use crate::error::{SessionError, SessionResult};
use crate::ledger::SessionLedger;
use crate::metadata::{discover_series, DiscoveredSeries};
use crate::models::{ManualArgs, SeriesInfo, SeriesMetadata, SessionMetadata, VersionInfo};
use crate::naming::classifier::{Classifier, MetadataClassifier};
use crate::naming::lookup::{Institution, LookupTable};
use crate::naming::manual::ManualNames;
use crate::naming::predictor::{Predictor, RulePredictor};
use crate::naming::resolver::{LayeredResolver, NameRegistry, Resolver, SeriesQuery};
use crate::provenance::{find_session_info, ProvenanceRecorder};
use crate::storage::{
    hash_file, hash_file_dir, hash_files, sanitize_filename, silent_remove, OutputTree,
};

/// What to do when the target session directory already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingOutput {
    #[default]
    Fail,
    /// Replace, but only if the source still hashes to the recorded input.
    Force,
    /// Replace unconditionally.
    Reckless,
    /// Keep the existing session and write to `<session>-<N>`.
    Safe,
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub source: PathBuf,
    pub metadata: SessionMetadata,
    pub lut_path: Option<PathBuf>,
    pub manual_args: ManualArgs,
    pub existing: ExistingOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesStatus {
    Converted,
    Excluded(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesOutcome {
    pub source_path: String,
    pub name: Option<String>,
    pub status: SeriesStatus,
}

/// Per-series summary of one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_dir: PathBuf,
    pub series: Vec<SeriesOutcome>,
}

impl SessionReport {
    fn count(&self, pred: impl Fn(&SeriesStatus) -> bool) -> usize {
        self.series.iter().filter(|s| pred(&s.status)).count()
    }

    pub fn converted(&self) -> usize {
        self.count(|s| matches!(s, SeriesStatus::Converted))
    }

    pub fn excluded(&self) -> usize {
        self.count(|s| matches!(s, SeriesStatus::Excluded(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SeriesStatus::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} converted, {} skipped, {} failed",
            self.session_dir.display(),
            self.converted(),
            self.excluded(),
            self.failed()
        )?;
        for series in &self.series {
            let name = series.name.as_deref().unwrap_or("-");
            match &series.status {
                SeriesStatus::Converted => writeln!(f, "  [OK]      {} -> {}", series.source_path, name)?,
                SeriesStatus::Excluded(reason) => {
                    writeln!(f, "  [SKIPPED] {} ({})", series.source_path, reason)?
                }
                SeriesStatus::Failed(reason) => {
                    writeln!(f, "  [FAILED]  {} -> {}: {}", series.source_path, name, reason)?
                }
            }
        }
        Ok(())
    }
}

/// A fully written session that is not yet visible under its final path.
#[derive(Debug)]
pub struct StagedSession {
    metadata: SessionMetadata,
    staging_dir: PathBuf,
    session_dir: PathBuf,
    replace: bool,
    report: SessionReport,
}

impl StagedSession {
    /// Moves the staging directory into place.
    pub fn publish(self) -> SessionResult<SessionReport> {
        if self.replace {
            silent_remove(&self.session_dir)?;
        } else if self.session_dir.exists() {
            return Err(SessionError::OutputExists(self.session_dir));
        }
        fs::rename(&self.staging_dir, &self.session_dir)?;
        info!("Published {} to {:?}", self.metadata.prefix(), self.session_dir);
        Ok(self.report)
    }

    pub fn discard(self) -> SessionResult<()> {
        silent_remove(&self.staging_dir)?;
        Ok(())
    }
}

/// Stage implementations plus the settings shared by every session of a run.
pub struct SessionPipeline {
    tree: OutputTree,
    settings: Settings,
    classifier: Arc<dyn Classifier>,
    predictor: Arc<dyn Predictor>,
    converter: Arc<dyn Converter>,
}

impl SessionPipeline {
    pub fn new(
        tree: OutputTree,
        settings: Settings,
        classifier: Arc<dyn Classifier>,
        predictor: Arc<dyn Predictor>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            tree,
            settings,
            classifier,
            predictor,
            converter,
        }
    }

    /// Header classifier, rule predictor and the configured external converter.
    pub fn with_defaults(tree: OutputTree, settings: Settings, force_derived: bool) -> Self {
        let converter = Arc::new(Dcm2NiixConverter::new(&settings.converter));
        Self::new(
            tree,
            settings,
            Arc::new(MetadataClassifier::new(force_derived)),
            Arc::new(RulePredictor),
            converter,
        )
    }

    pub fn tree(&self) -> &OutputTree {
        &self.tree
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Stage and publish a non-anonymized session.
    pub async fn convert(&self, request: SessionRequest) -> SessionResult<SessionReport> {
        self.stage(request, None).await?.publish()
    }

    /// Converts into a hidden staging directory. With a plan, subject and session come
    /// from the anonymization mapping and identifying fields are replaced before recording.
    pub async fn stage(
        &self,
        request: SessionRequest,
        plan: Option<&AnonymizationPlan>,
    ) -> SessionResult<StagedSession> {
        let mut metadata = request.metadata.clone();
        if let Some(plan) = plan {
            metadata.subject_id = plan.anon_id.clone();
            metadata.session_id = plan.session_id.clone();
        }

        let source = request.source.clone();
        let (input_hash, discovered) = run_blocking(move || {
            let hash = hash_file_dir(&source)?;
            let series = discover_series(&source)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:#}", e)))?;
            Ok((hash, series))
        })
        .await?;
        if discovered.is_empty() {
            return Err(SessionError::NoSeries(request.source.clone()));
        }

        // Manual naming is read from the session being replaced or retried.
        let previous_dir = self.tree.session_dir(&metadata);
        let replace = self.prepare_output(&mut metadata, request.existing, &input_hash)?;
        let session_dir = self.tree.session_dir(&metadata);
        let staging_dir = self.tree.staging_dir(&metadata);
        silent_remove(&staging_dir)?;
        fs::create_dir_all(&staging_dir)?;

        let manual_file = ManualNames::file_path(&previous_dir, &metadata);
        match self
            .fill_staging(
                &staging_dir,
                &session_dir,
                &metadata,
                &request,
                plan,
                &manual_file,
                input_hash,
                discovered,
            )
            .await
        {
            Ok(report) => Ok(StagedSession {
                metadata,
                staging_dir,
                session_dir,
                replace,
                report,
            }),
            Err(err) => {
                silent_remove(&staging_dir)?;
                Err(err)
            }
        }
    }

    /// Returns whether an existing session will be replaced on publish.
    fn prepare_output(
        &self,
        metadata: &mut SessionMetadata,
        existing: ExistingOutput,
        input_hash: &str,
    ) -> SessionResult<bool> {
        let session_dir = self.tree.session_dir(metadata);
        if !session_dir.exists() {
            return Ok(false);
        }
        match existing {
            ExistingOutput::Fail => Err(SessionError::OutputExists(session_dir)),
            ExistingOutput::Reckless => Ok(true),
            ExistingOutput::Force => {
                let (_, recorded) = find_session_info(&session_dir).map_err(|_| {
                    SessionError::Invalid(format!(
                        "no session record in {:?} to check against; use --reckless instead",
                        session_dir
                    ))
                })?;
                if recorded.input_hash != input_hash {
                    return Err(SessionError::Invalid(
                        "source files have changed since the last conversion; use --reckless to overwrite"
                            .into(),
                    ));
                }
                Ok(true)
            }
            ExistingOutput::Safe => {
                let mut attempt = 2;
                loop {
                    metadata.attempt_num = Some(attempt);
                    if !self.tree.session_dir(metadata).exists() {
                        return Ok(false);
                    }
                    attempt += 1;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fill_staging(
        &self,
        staging: &Path,
        session_dir: &Path,
        metadata: &SessionMetadata,
        request: &SessionRequest,
        plan: Option<&AnonymizationPlan>,
        manual_file: &Path,
        input_hash: String,
        discovered: Vec<DiscoveredSeries>,
    ) -> SessionResult<SessionReport> {
        let ctx = StageContext::session(&metadata.prefix());
        let dcm_dir = staging.join("dcm");
        let nii_dir = staging.join("nii");
        let logs_dir = staging.join("logs");
        for dir in [&dcm_dir, &nii_dir, &logs_dir] {
            fs::create_dir_all(dir)?;
        }

        let copy_target = dcm_dir.clone();
        let copied = run_blocking(move || copy_series(&copy_target, discovered)).await?;
        ctx.info(&format!("{} series found", copied.len()));

        let lut_path = request
            .lut_path
            .clone()
            .unwrap_or_else(|| default_lut_path(self.tree.root(), &metadata.project_id));
        let lookup =
            LookupTable::load_or_create(&lut_path, &metadata.project_id, metadata.site_id.as_deref())?;
        let manual = ManualNames::load(manual_file)?;
        if manual_file.exists() {
            fs::copy(manual_file, ManualNames::file_path(staging, metadata))?;
        }
        let ledger = SessionLedger::current(&lookup, &manual);
        let resolver = LayeredResolver::new(lookup, manual, self.settings.naming.extras_mode);
        let converter_version = self.converter.version().await;
        ctx.info(&format!(
            "converter: {} {}",
            self.converter.name(),
            converter_version.as_deref().unwrap_or("(unknown version)")
        ));
        let recorder = ProvenanceRecorder::new(
            VersionInfo::current(converter_version),
            input_hash,
            resolver.lookup(),
            metadata.clone(),
            plan.is_some(),
            request.manual_args.clone(),
        );

        let mut registry = NameRegistry::default();
        let mut report = SessionReport {
            session_dir: session_dir.to_path_buf(),
            series: Vec::new(),
        };
        let mut series_list = Vec::with_capacity(copied.len());

        for copy in copied {
            let source_path = format!("dcm/{}", copy.dir_name);
            let series_ctx = ctx.series(&source_path);
            let mut meta = copy.series.metadata;
            apply_manual_args(&request.manual_args, &mut meta);

            let classification = self.classifier.classify(&series_ctx, &meta);
            let mut info = SeriesInfo {
                metadata: meta.clone(),
                multi_frame: meta.is_multiframe(),
                num_files: copy.series.files.len(),
                source_path: source_path.clone(),
                intake_path: None,
                source_hash: copy.source_hash,
                convert_image: classification.convert,
                error_code: classification.error.as_ref().map(|e| e.code()),
                exclude_reason: classification.exclude_reason.clone(),
                predicted_name: None,
                lookup_name: None,
                manual_name: None,
                nifti_name: None,
                nifti_created: false,
                nifti_hash: None,
                conversion_error: None,
            };
            if let Some(plan) = plan {
                plan.apply(&mut info.metadata);
            }

            if !classification.convert {
                report.series.push(SeriesOutcome {
                    source_path,
                    name: None,
                    status: SeriesStatus::Excluded(
                        classification
                            .exclude_reason
                            .unwrap_or_else(|| "not convertible".into()),
                    ),
                });
                series_list.push(info);
                continue;
            }

            let predicted = self.predictor.predict(&series_ctx, &meta);
            let resolution = resolver.resolve(
                &series_ctx,
                &predicted,
                &SeriesQuery {
                    description: meta.series_description.as_deref(),
                    institution: meta.institution_name.as_deref().map(Institution::Plain),
                    source_path: Some(source_path.as_str()),
                },
            );
            let name = registry.claim(resolution.name.clone());
            let stem = recorder.stem(&name.render());
            info.predicted_name = Some(predicted);
            info.lookup_name = resolution.lookup_name.clone();
            info.manual_name = resolution.manual_name.clone();
            info.nifti_name = Some(stem.clone());

            let job = ConversionJob {
                input_dir: dcm_dir.join(&copy.dir_name),
                output_dir: nii_dir.clone(),
                stem: stem.clone(),
                log_path: logs_dir.join(format!("{}.log", stem)),
            };
            let status = match self.converter.convert(&job).await {
                Ok(output) => {
                    info.nifti_created = true;
                    info.nifti_hash = Some(hash_file(&output.image_path)?);
                    recorder.write_sidecar(
                        &nii_dir,
                        &info,
                        &resolution.lookup_rows,
                        &resolution.manual_entries,
                    )?;
                    series_ctx.info(&format!("converted to {}", stem));
                    SeriesStatus::Converted
                }
                Err(err) => {
                    series_ctx.warn(&format!("conversion failed: {}", err));
                    info.conversion_error = Some(err.to_string());
                    SeriesStatus::Failed(err.to_string())
                }
            };
            report.series.push(SeriesOutcome {
                source_path,
                name: Some(stem),
                status,
            });
            series_list.push(info);
        }

        let info = recorder.session_info(resolver.lookup(), resolver.manual(), series_list);
        recorder.write_session_info(staging, &info)?;
        ledger.save(&SessionLedger::file_path(staging, metadata))?;

        if plan.is_some() {
            // Raw DICOM copies still carry identifiers.
            silent_remove(&dcm_dir)?;
        }
        ctx.info(&format!(
            "{} converted, {} skipped, {} failed",
            report.converted(),
            report.excluded(),
            report.failed()
        ));
        Ok(report)
    }
}

/// Values given on the command line replace the header values before naming.
pub fn apply_manual_args(args: &ManualArgs, meta: &mut SeriesMetadata) {
    if let Some(strength) = args.magnetic_field_strength {
        meta.magnetic_field_strength = Some(strength);
    }
    if let Some(institution) = &args.institution_name {
        meta.institution_name = Some(institution.clone());
    }
}

struct CopiedSeries {
    series: DiscoveredSeries,
    dir_name: String,
    source_hash: String,
}

fn copy_series(dcm_dir: &Path, discovered: Vec<DiscoveredSeries>) -> io::Result<Vec<CopiedSeries>> {
    discovered
        .into_iter()
        .map(|series| {
            let dir_name = series.dir_name();
            let target = dcm_dir.join(&dir_name);
            fs::create_dir_all(&target)?;
            let mut copied = Vec::with_capacity(series.files.len());
            for (idx, file) in series.files.iter().enumerate() {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(sanitize_filename)
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| format!("{:05}.dcm", idx));
                let mut dest = target.join(&name);
                if dest.exists() {
                    dest = target.join(format!("{:05}-{}", idx, name));
                }
                fs::copy(file, &dest)?;
                copied.push(dest);
            }
            let source_hash = hash_files(&target, &copied)?;
            Ok(CopiedSeries {
                series,
                dir_name,
                source_hash,
            })
        })
        .collect()
}

/// Runs filesystem-heavy work off the async worker threads.
async fn run_blocking<T, F>(work: F) -> SessionResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SessionError::Invalid(format!("background task failed: {}", e)))?
        .map_err(SessionError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_args_win_over_headers() {
        let mut meta = SeriesMetadata {
            institution_name: Some("Header Hospital".into()),
            magnetic_field_strength: Some(1.5),
            ..Default::default()
        };
        apply_manual_args(
            &ManualArgs {
                magnetic_field_strength: Some(3.0),
                institution_name: None,
            },
            &mut meta,
        );
        assert_eq!(meta.magnetic_field_strength, Some(3.0));
        assert_eq!(meta.institution_name.as_deref(), Some("Header Hospital"));
    }

    #[test]
    fn report_summary_counts_each_status() {
        let report = SessionReport {
            session_dir: PathBuf::from("/out/p/P-S/1"),
            series: vec![
                SeriesOutcome {
                    source_path: "dcm/0001-A".into(),
                    name: Some("P-S_1_BRAIN-T1".into()),
                    status: SeriesStatus::Converted,
                },
                SeriesOutcome {
                    source_path: "dcm/0002-B".into(),
                    name: None,
                    status: SeriesStatus::Excluded("Localizer".into()),
                },
                SeriesOutcome {
                    source_path: "dcm/0003-C".into(),
                    name: Some("P-S_1_BRAIN-T2".into()),
                    status: SeriesStatus::Failed("timed out".into()),
                },
            ],
        };
        assert_eq!((report.converted(), report.excluded(), report.failed()), (1, 1, 1));
        assert!(!report.is_success());
        let text = report.to_string();
        assert!(text.contains("1 converted, 1 skipped, 1 failed"));
        assert!(text.contains("[FAILED]  dcm/0003-C"));
    }

    #[test]
    fn copied_series_get_hashed_directories() {
        let src = tempfile::tempdir().expect("tmpdir");
        let out = tempfile::tempdir().expect("tmpdir");
        let file = src.path().join("img 1.dcm");
        fs::write(&file, b"data").unwrap();
        let series = DiscoveredSeries {
            files: vec![file],
            metadata: SeriesMetadata {
                series_uid: Some("1.2.3".into()),
                series_number: Some(7),
                ..Default::default()
            },
        };
        let copied = copy_series(out.path(), vec![series]).unwrap();
        assert_eq!(copied.len(), 1);
        assert!(copied[0].dir_name.starts_with("0007-"));
        assert!(out.path().join(&copied[0].dir_name).join("img1.dcm").exists());
    }
}
