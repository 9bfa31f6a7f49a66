//
// cli.rs
// radifox
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the corresponding modules.
//
// Thales Matheus Mendonça Santos - October 2026

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use crate::anonymize::AnonymizationStore;
use crate::batch::{self, SubjectOptions};
use crate::config::Settings;
use crate::deanonymize::{deanonymize, DeanonymizeTarget};
use crate::models::{ManualArgs, SessionMetadata};
use crate::session::{ExistingOutput, SessionPipeline, SessionRequest};
use crate::storage::OutputTree;
use crate::update::{update_session, UpdateOptions, UpdateOutcome};

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "radifox", version)]
#[command(about = "Deterministic naming, provenance and anonymization for DICOM to NIfTI conversion", long_about = None)]
pub struct Cli {
    /// TOML settings file
    #[arg(long, global = true, env = "RADIFOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug-level logging when RUST_LOG is not set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where converted sessions go and which project/site they belong to.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    #[arg(short, long)]
    pub output_root: PathBuf,
    #[arg(short, long = "project-id")]
    pub project_id: String,
    #[arg(long = "site-id")]
    pub site_id: Option<String>,
    /// Look-up table (default: <output-root>/<project>/<project>-lut.csv)
    #[arg(short, long = "lut-file")]
    pub lut_file: Option<PathBuf>,
}

/// Handling of an already converted session.
#[derive(Args, Debug, Clone, Copy)]
pub struct ExistingArgs {
    /// Re-run if the source is unchanged since the last conversion
    #[arg(long, group = "existing")]
    pub force: bool,
    /// Re-run and overwrite existing data
    #[arg(long, group = "existing")]
    pub reckless: bool,
    /// Add -N to the session directory if the session exists
    #[arg(long, group = "existing")]
    pub safe: bool,
}

impl From<ExistingArgs> for ExistingOutput {
    fn from(args: ExistingArgs) -> Self {
        if args.safe {
            ExistingOutput::Safe
        } else if args.reckless {
            ExistingOutput::Reckless
        } else if args.force {
            ExistingOutput::Force
        } else {
            ExistingOutput::Fail
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Convert one DICOM source into a session directory
    Convert {
        source: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        existing: ExistingArgs,
        #[arg(short, long = "subject-id", required_unless_present = "anon_db")]
        subject_id: Option<String>,
        #[arg(short = 'e', long = "session-id", required_unless_present = "anon_db")]
        session_id: Option<String>,
        /// Institution name to record instead of the DICOM value
        #[arg(long)]
        institution: Option<String>,
        /// Magnetic field strength to record instead of the DICOM value
        #[arg(long)]
        field_strength: Option<f64>,
        /// Convert derived/secondary series that would normally be skipped
        #[arg(long)]
        force_derived: bool,
        /// Anonymize using this mapping store; subject and session come from the store
        #[arg(long)]
        anon_db: Option<PathBuf>,
        #[arg(long, requires = "anon_db", allow_hyphen_values = true)]
        date_shift_days: Option<i64>,
    },
    /// Convert every subject subdirectory of a source directory
    Batch {
        source: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        existing: ExistingArgs,
        #[arg(long)]
        force_derived: bool,
        #[arg(long)]
        anon_db: Option<PathBuf>,
        #[arg(long, requires = "anon_db", allow_hyphen_values = true)]
        date_shift_days: Option<i64>,
    },
    /// Re-apply naming to an existing session directory
    Update {
        directory: PathBuf,
        #[arg(short, long = "lut-file")]
        lut_file: Option<PathBuf>,
        /// Update even when nothing changed
        #[arg(long)]
        force: bool,
    },
    /// Reverse anonymization using the mapping store
    Deanonymize {
        #[arg(short, long)]
        output_root: PathBuf,
        #[arg(short, long = "project-id")]
        project_id: String,
        #[arg(long)]
        anon_db: PathBuf,
        /// Only this PatientID
        #[arg(long, conflicts_with = "anon_id")]
        subject: Option<String>,
        /// Only this anonymous subject id
        #[arg(long)]
        anon_id: Option<String>,
    },
}

fn with_date_shift(mut settings: Settings, date_shift_days: Option<i64>) -> Settings {
    if date_shift_days.is_some() {
        settings.anonymization.date_shift_days = date_shift_days;
    }
    settings
}

async fn open_store(path: Option<PathBuf>, settings: &Settings) -> anyhow::Result<Option<AnonymizationStore>> {
    match path {
        Some(path) => Ok(Some(
            AnonymizationStore::open(&path, settings.anonymization.clone())
                .await
                .with_context(|| format!("Failed to open mapping store {:?}", path))?,
        )),
        None => Ok(None),
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Convert {
            source,
            target,
            existing,
            subject_id,
            session_id,
            institution,
            field_strength,
            force_derived,
            anon_db,
            date_shift_days,
        } => {
            let settings = with_date_shift(settings, date_shift_days);
            let store = open_store(anon_db, &settings).await?;
            let pipeline = SessionPipeline::with_defaults(
                OutputTree::new(&target.output_root),
                settings,
                force_derived,
            );
            let manual_args = ManualArgs {
                magnetic_field_strength: field_strength,
                institution_name: institution,
            };

            let report = match store {
                Some(store) => {
                    let options = SubjectOptions {
                        project_id: target.project_id,
                        site_id: target.site_id,
                        lut_path: target.lut_file,
                        manual_args,
                        existing: existing.into(),
                        store: Some(store.clone()),
                    };
                    let result = batch::convert_subject(&pipeline, &source, &options).await;
                    store.close().await;
                    result?
                }
                None => {
                    let (Some(subject_id), Some(session_id)) = (subject_id, session_id) else {
                        bail!("--subject-id and --session-id are required without --anon-db");
                    };
                    let request = SessionRequest {
                        source,
                        metadata: SessionMetadata::new(
                            &target.project_id,
                            &subject_id,
                            &session_id,
                            target.site_id.as_deref(),
                        ),
                        lut_path: target.lut_file,
                        manual_args,
                        existing: existing.into(),
                    };
                    pipeline.convert(request).await?
                }
            };
            print!("{}", report);
            if !report.is_success() {
                bail!("{} series failed to convert", report.failed());
            }
        }
        Commands::Batch {
            source,
            target,
            existing,
            force_derived,
            anon_db,
            date_shift_days,
        } => {
            let settings = with_date_shift(settings, date_shift_days);
            let store = open_store(anon_db, &settings).await?;
            let pipeline = Arc::new(SessionPipeline::with_defaults(
                OutputTree::new(&target.output_root),
                settings,
                force_derived,
            ));
            let options = SubjectOptions {
                project_id: target.project_id,
                site_id: target.site_id,
                lut_path: target.lut_file,
                manual_args: ManualArgs::default(),
                existing: existing.into(),
                store: store.clone(),
            };
            let result = batch::run_batch(pipeline, &source, options).await;
            if let Some(store) = store {
                store.close().await;
            }
            let report = result?;
            print!("{}", report);
            if report.failed() > 0 {
                bail!("{} subject(s) failed", report.failed());
            }
        }
        Commands::Update {
            directory,
            lut_file,
            force,
        } => {
            let options = UpdateOptions {
                lut_path: lut_file,
                force,
            };
            match update_session(&directory, &settings, &options)? {
                UpdateOutcome::Skipped => println!(
                    "No action required. Naming version, look-up table and manual names match for {}.",
                    directory.display()
                ),
                UpdateOutcome::Updated { renamed } => println!(
                    "Updated {}: {} series renamed.",
                    directory.display(),
                    renamed
                ),
                UpdateOutcome::Partial { renamed, failed } => bail!(
                    "Update of {} incomplete ({} renamed); failed: {}",
                    directory.display(),
                    renamed,
                    failed.join(", ")
                ),
            }
        }
        Commands::Deanonymize {
            output_root,
            project_id,
            anon_db,
            subject,
            anon_id,
        } => {
            if !anon_db.exists() {
                bail!("Mapping store {:?} does not exist", anon_db);
            }
            let store = AnonymizationStore::open(&anon_db, settings.anonymization.clone()).await?;
            let project_dir = output_root.join(project_id.to_lowercase());
            let target = match (subject, anon_id) {
                (Some(patient_id), _) => DeanonymizeTarget::Patient(patient_id),
                (None, Some(anon_id)) => DeanonymizeTarget::Anonymous(anon_id),
                (None, None) => DeanonymizeTarget::All,
            };
            let result = deanonymize(&store, &project_dir, &project_id, &target).await;
            store.close().await;
            let report = result?;
            println!(
                "--- De-anonymized {} subject(s), {} session(s) ---",
                report.subjects, report.sessions
            );
            for (anon_id, reason) in &report.failed {
                println!("  {}: FAILED: {}", anon_id, reason);
            }
            if !report.is_success() {
                bail!("{} subject(s) could not be restored", report.failed.len());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn existing_output_flags_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "radifox", "convert", "in", "-o", "out", "-p", "P", "-s", "S", "-e", "1", "--force",
            "--safe",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn anonymized_convert_needs_no_subject() {
        let cli = Cli::try_parse_from([
            "radifox", "convert", "in", "-o", "out", "-p", "P", "--anon-db", "map.db",
            "--date-shift-days", "-30",
        ])
        .expect("parse");
        match cli.command {
            Commands::Convert {
                subject_id,
                date_shift_days,
                ..
            } => {
                assert!(subject_id.is_none());
                assert_eq!(date_shift_days, Some(-30));
            }
            _ => panic!("expected convert"),
        }
    }

    #[test]
    fn deanonymize_accepts_one_kind_of_subject() {
        let cli = Cli::try_parse_from([
            "radifox", "deanonymize", "-o", "out", "-p", "P", "--anon-db", "map.db", "--anon-id",
            "A3F7B2C1D4E5",
        ])
        .expect("parse");
        match cli.command {
            Commands::Deanonymize { anon_id, subject, .. } => {
                assert_eq!(anon_id.as_deref(), Some("A3F7B2C1D4E5"));
                assert!(subject.is_none());
            }
            _ => panic!("expected deanonymize"),
        }
        assert!(Cli::try_parse_from([
            "radifox", "deanonymize", "-o", "out", "-p", "P", "--anon-db", "map.db", "--anon-id",
            "A3F7B2C1D4E5", "--subject", "PAT123",
        ])
        .is_err());
    }

    #[test]
    fn date_shift_requires_mapping_store() {
        assert!(Cli::try_parse_from([
            "radifox", "batch", "in", "-o", "out", "-p", "P", "--date-shift-days", "5",
        ])
        .is_err());
    }
}
