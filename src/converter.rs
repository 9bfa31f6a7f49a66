//
// converter.rs
// radifox
//
// Drives the external DICOM-to-NIfTI converter as a subprocess, bounded by a timeout.
//
// Thales Matheus Mendonça Santos - October 2026

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::ConverterSettings;
use crate::error::ConvertError;

/// One series to convert: every file in `input_dir` becomes `<output_dir>/<stem>.nii.gz`.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub stem: String,
    pub log_path: PathBuf,
}

impl ConversionJob {
    pub fn expected_output(&self) -> PathBuf {
        self.output_dir.join(format!("{}.nii.gz", self.stem))
    }
}

#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub image_path: PathBuf,
}

#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    /// Version string recorded in provenance, if the tool reports one.
    async fn version(&self) -> Option<String>;

    async fn convert(&self, job: &ConversionJob) -> Result<ConversionOutput, ConvertError>;
}

/// `dcm2niix`-compatible command line converter.
#[derive(Debug, Clone)]
pub struct Dcm2NiixConverter {
    program: String,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl Dcm2NiixConverter {
    pub fn new(settings: &ConverterSettings) -> Self {
        Self {
            program: settings.program.clone(),
            timeout: settings.timeout(),
            extra_args: settings.extra_args.clone(),
        }
    }
}

#[async_trait]
impl Converter for Dcm2NiixConverter {
    fn name(&self) -> &str {
        &self.program
    }

    async fn version(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(Duration::from_secs(10), output)
            .await
            .ok()?
            .ok()?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }

    async fn convert(&self, job: &ConversionJob) -> Result<ConversionOutput, ConvertError> {
        tokio::fs::create_dir_all(&job.output_dir).await?;
        let mut cmd = Command::new(&self.program);
        cmd.args(["-z", "y", "-b", "n", "-f"])
            .arg(&job.stem)
            .arg("-o")
            .arg(&job.output_dir)
            .args(&self.extra_args)
            .arg(&job.input_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Running {:?}", cmd);

        let child = cmd.spawn().map_err(|source| ConvertError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConvertError::Timeout(self.timeout)),
        };

        if let Some(parent) = job.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log = output.stdout;
        log.extend_from_slice(&output.stderr);
        tokio::fs::write(&job.log_path, &log).await?;

        if !output.status.success() {
            return Err(ConvertError::Failed {
                status: output.status.to_string(),
            });
        }
        let image_path = job.expected_output();
        if !image_path.exists() {
            return Err(ConvertError::MissingOutput(image_path));
        }
        Ok(ConversionOutput { image_path })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(format!("{}.sh", name));
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn job(dir: &std::path::Path) -> ConversionJob {
        ConversionJob {
            input_dir: dir.join("dcm"),
            output_dir: dir.join("nii"),
            stem: "P-S_1_BRAIN-T1".into(),
            log_path: dir.join("logs").join("P-S_1_BRAIN-T1.log"),
        }
    }

    #[tokio::test]
    async fn successful_run_produces_image_and_log() {
        let dir = tempdir().expect("tmpdir");
        let program = script(
            dir.path(),
            "ok",
            r#"while [ $# -gt 1 ]; do
  case "$1" in
    -f) stem="$2"; shift 2;;
    -o) out="$2"; shift 2;;
    *) shift;;
  esac
done
echo converting
touch "$out/$stem.nii.gz""#,
        );
        let converter = Dcm2NiixConverter::new(&ConverterSettings {
            program,
            timeout_secs: 30,
            extra_args: Vec::new(),
        });
        let job = job(dir.path());
        let output = converter.convert(&job).await.expect("convert");
        assert_eq!(output.image_path, job.expected_output());
        assert!(fs::read_to_string(&job.log_path).unwrap().contains("converting"));
    }

    #[tokio::test]
    async fn failures_and_timeouts_are_reported_per_job() {
        let dir = tempdir().expect("tmpdir");
        let failing = Dcm2NiixConverter::new(&ConverterSettings {
            program: script(dir.path(), "fail", "exit 3"),
            timeout_secs: 30,
            extra_args: Vec::new(),
        });
        assert!(matches!(
            failing.convert(&job(dir.path())).await,
            Err(ConvertError::Failed { .. })
        ));

        let slow = Dcm2NiixConverter::new(&ConverterSettings {
            program: script(dir.path(), "slow", "sleep 5"),
            timeout_secs: 0,
            extra_args: Vec::new(),
        });
        assert!(matches!(
            slow.convert(&job(dir.path())).await,
            Err(ConvertError::Timeout(_))
        ));

        let missing = Dcm2NiixConverter::new(&ConverterSettings {
            program: dir.path().join("does-not-exist").display().to_string(),
            timeout_secs: 30,
            extra_args: Vec::new(),
        });
        assert!(matches!(
            missing.convert(&job(dir.path())).await,
            Err(ConvertError::Spawn { .. })
        ));
    }
}
