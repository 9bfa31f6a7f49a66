//
// batch.rs
// radifox
//
// Converts every subject subdirectory of a source directory, concurrently, optionally anonymizing.
//
// Thales Matheus Mendonça Santos - October 2026

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::anonymize::AnonymizationStore;
use crate::metadata::{extract_patient_identity, find_first_dicom};
use crate::models::{ManualArgs, SessionMetadata};
use crate::session::{ExistingOutput, SessionPipeline, SessionReport, SessionRequest};

/// Options shared by every subject of a batch.
#[derive(Clone)]
pub struct SubjectOptions {
    pub project_id: String,
    pub site_id: Option<String>,
    pub lut_path: Option<PathBuf>,
    pub manual_args: ManualArgs,
    pub existing: ExistingOutput,
    /// Mapping store; subjects are anonymized when present.
    pub store: Option<AnonymizationStore>,
}

#[derive(Debug)]
pub struct SubjectOutcome {
    pub name: String,
    pub result: Result<SessionReport, String>,
}

impl SubjectOutcome {
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(report) if report.is_success())
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub subjects: Vec<SubjectOutcome>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.subjects.iter().filter(|s| !s.is_success()).count()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Batch conversion complete ---")?;
        writeln!(
            f,
            "Processed: {}, Failed: {}",
            self.subjects.len() - self.failed(),
            self.failed()
        )?;
        for subject in &self.subjects {
            match &subject.result {
                Ok(report) if report.is_success() => {}
                Ok(report) => writeln!(
                    f,
                    "  {}: {} of {} series failed",
                    subject.name,
                    report.failed(),
                    report.series.len()
                )?,
                Err(reason) => writeln!(f, "  {}: {}", subject.name, reason)?,
            }
        }
        Ok(())
    }
}

/// Converts one subject directory. Subject and session come from the mapping store when
/// anonymizing; otherwise the subject is the PatientID (or directory name) and the session is `1`.
pub async fn convert_subject(
    pipeline: &SessionPipeline,
    subject_dir: &Path,
    options: &SubjectOptions,
) -> Result<SessionReport> {
    let dir = subject_dir.to_path_buf();
    let identity = tokio::task::spawn_blocking(move || {
        find_first_dicom(&dir).map(|obj| extract_patient_identity(&obj))
    })
    .await?
    .ok_or_else(|| anyhow!("No valid DICOM files in {:?}", subject_dir))?;

    let patient_id = identity
        .patient_id
        .clone()
        .or_else(|| {
            subject_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .ok_or_else(|| anyhow!("Cannot derive a subject id for {:?}", subject_dir))?;

    let request = SessionRequest {
        source: subject_dir.to_path_buf(),
        metadata: SessionMetadata::new(
            &options.project_id,
            &patient_id,
            "1",
            options.site_id.as_deref(),
        ),
        lut_path: options.lut_path.clone(),
        manual_args: options.manual_args.clone(),
        existing: options.existing,
    };

    let Some(store) = &options.store else {
        return Ok(pipeline.convert(request).await?);
    };

    // The reservation keeps the mapping uncommitted until the session is fully staged.
    let reservation = store
        .reserve(&patient_id, &identity, &subject_dir.display().to_string())
        .await?;
    if reservation.is_new_subject() {
        info!(
            "New anonymous subject {} for {:?}",
            reservation.plan().anon_id,
            subject_dir
        );
    }
    match pipeline.stage(request, Some(reservation.plan())).await {
        Ok(staged) => {
            if let Err(err) = reservation.commit().await {
                staged.discard()?;
                return Err(err.into());
            }
            Ok(staged.publish()?)
        }
        Err(err) => {
            reservation.rollback().await?;
            Err(err.into())
        }
    }
}

fn subject_dirs(source: &Path) -> Result<Vec<PathBuf>> {
    if !source.is_dir() {
        bail!("Source must be a directory containing subject subdirectories");
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(source)
        .with_context(|| format!("Failed to list {:?}", source))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    if dirs.is_empty() {
        bail!("No subdirectories found in {:?}", source);
    }
    Ok(dirs)
}

/// Runs every subject of `source`, at most `batch.max_concurrent_subjects` at a time.
///
/// With a mapping store, each subject holds the store writer lock and its open mapping
/// transaction from reservation until its session is staged, so anonymizing subjects
/// are converted one at a time whatever the concurrency setting.
pub async fn run_batch(
    pipeline: Arc<SessionPipeline>,
    source: &Path,
    options: SubjectOptions,
) -> Result<BatchReport> {
    let dirs = subject_dirs(source)?;
    info!("Found {} subdirectories to process", dirs.len());
    if let Some(store) = &options.store {
        info!("Anonymization enabled (mapping store: {:?})", store.path());
    }

    let limit = pipeline.settings().batch.max_concurrent_subjects.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let options = Arc::new(options);
    let mut tasks = JoinSet::new();

    for dir in dirs {
        let pipeline = pipeline.clone();
        let options = options.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dir.display().to_string());
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => convert_subject(&pipeline, &dir, &options)
                    .await
                    .map_err(|e| format!("{:#}", e)),
                Err(e) => Err(e.to_string()),
            };
            match &result {
                Ok(report) if report.is_success() => info!("{}: OK", name),
                Ok(report) => warn!("{}: {} series failed", name, report.failed()),
                Err(reason) => warn!("{}: FAILED: {}", name, reason),
            }
            SubjectOutcome { name, result }
        });
    }

    let mut report = BatchReport::default();
    while let Some(joined) = tasks.join_next().await {
        report.subjects.push(joined.context("Subject task panicked")?);
    }
    report.subjects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(report)
}
