//! Run bundle - the write-once evidence directory for one attempt.
//!
//! Layout under `<runs_root>/<run_id>/`:
//! - `firmware/` image and ELF copies (or placeholders)
//! - `uart.log` timestamped transcript
//! - `analysis.json`, `decision.json` structured results
//! - `triage.md` human-readable notes
//! - `manifest.json` written last

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::build::BuildArtifacts;
use super::triage;
use crate::domain::{Attempt, AttemptStatus, CaseSpec, ExperimentParams, Stage};
use crate::error::Result;
use crate::flash::FlashMethod;
use crate::id::format_ts;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const UART_LOG_FILE: &str = "uart.log";
pub const ANALYSIS_FILE: &str = "analysis.json";
pub const DECISION_FILE: &str = "decision.json";
pub const TRIAGE_FILE: &str = "triage.md";
pub const FIRMWARE_DIR: &str = "firmware";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestError {
    pub stage: Stage,
    pub message: String,
}

/// `manifest.json` contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub case_id: String,
    pub attempt: u32,
    pub params: ExperimentParams,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: Option<AttemptStatus>,
    pub flash_method: Option<FlashMethod>,
    #[serde(default)]
    pub flash_diagnostics: Vec<String>,
    pub serial_endpoint: Option<String>,
    pub firmware: Option<BuildArtifacts>,
    pub error: Option<ManifestError>,
    /// Bundle files written before the manifest
    pub files: Vec<String>,
}

impl Manifest {
    pub fn from_attempt(attempt: &Attempt, firmware: Option<&BuildArtifacts>, files: Vec<String>) -> Self {
        Self {
            run_id: attempt.run_id.clone(),
            case_id: attempt.case_id.clone(),
            attempt: attempt.index,
            params: attempt.params.clone(),
            started_at: format_ts(&attempt.started_at),
            finished_at: attempt.finished_at.as_ref().map(format_ts),
            status: attempt.status,
            flash_method: attempt.flash_method,
            flash_diagnostics: attempt.flash_diagnostics.clone(),
            serial_endpoint: attempt.serial_endpoint.clone(),
            firmware: firmware.cloned(),
            error: attempt.error.as_ref().map(|(stage, message)| ManifestError {
                stage: *stage,
                message: message.clone(),
            }),
            files,
        }
    }
}

/// Handle on one attempt's bundle directory.
#[derive(Debug, Clone)]
pub struct RunBundle {
    dir: PathBuf,
}

impl RunBundle {
    /// Create `<root>/<run_id>/` and its firmware directory. Fails if the
    /// bundle already exists.
    pub async fn create(root: &Path, run_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let dir = root.join(run_id);
        tokio::fs::create_dir(&dir).await?;
        tokio::fs::create_dir(dir.join(FIRMWARE_DIR)).await?;
        debug!(dir = %dir.display(), "Created run bundle");
        Ok(Self { dir })
    }

    /// Open an existing bundle for reading.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn firmware_dir(&self) -> PathBuf {
        self.dir.join(FIRMWARE_DIR)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn write_new(&self, name: &str, contents: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name))
            .await?;
        file.write_all(contents).await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.write_new(name, json.as_bytes()).await
    }

    /// Write everything the attempt holds, manifest last. Called once per
    /// attempt, including attempts that ended in an error.
    pub async fn finalize(&self, attempt: &Attempt, case: &CaseSpec, firmware: Option<&BuildArtifacts>) -> Result<Manifest> {
        let mut files = Vec::new();
        if let Some(transcript) = &attempt.transcript {
            self.write_new(UART_LOG_FILE, transcript.to_log().as_bytes()).await?;
            files.push(UART_LOG_FILE.to_string());
        }
        if let Some(analysis) = &attempt.analysis {
            self.write_json(ANALYSIS_FILE, analysis).await?;
            files.push(ANALYSIS_FILE.to_string());
        }
        if let Some(decision) = &attempt.decision {
            self.write_json(DECISION_FILE, decision).await?;
            files.push(DECISION_FILE.to_string());
        }
        self.write_new(TRIAGE_FILE, triage::render(attempt, case).as_bytes()).await?;
        files.push(TRIAGE_FILE.to_string());

        let manifest = Manifest::from_attempt(attempt, firmware, files);
        self.write_json(MANIFEST_FILE, &manifest).await?;
        debug!(run_id = %attempt.run_id, dir = %self.dir.display(), "Bundle finalized");
        Ok(manifest)
    }

    pub fn read_manifest(&self) -> Result<Manifest> {
        let text = std::fs::read_to_string(self.path(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;
    use crate::domain::{Transcript, builtin_cases};
    use tempfile::TempDir;

    fn attempt() -> Attempt {
        let case = builtin_cases().remove("rate_hunt").unwrap();
        Attempt::new(1, "run_bundle_test", "rate_hunt", case.initial_params())
    }

    #[tokio::test]
    async fn test_create_refuses_existing_dir() {
        let root = TempDir::new().unwrap();
        RunBundle::create(root.path(), "r1").await.unwrap();
        assert!(RunBundle::create(root.path(), "r1").await.is_err());
    }

    #[tokio::test]
    async fn test_finalize_writes_all_files() {
        let root = TempDir::new().unwrap();
        let case = builtin_cases().remove("rate_hunt").unwrap();
        let bundle = RunBundle::create(root.path(), "run_bundle_test").await.unwrap();

        let mut attempt = attempt();
        let transcript = Transcript::from_lines(Some("run_bundle_test".into()), Vec::new(), true);
        attempt.analysis = Some(analyze(&transcript, &attempt.params));
        attempt.transcript = Some(transcript);
        attempt.serial_endpoint = Some("sim://rate_hunt".into());
        attempt.finish(AttemptStatus::Failed);

        let manifest = bundle.finalize(&attempt, &case, None).await.unwrap();
        assert_eq!(manifest.files, vec![UART_LOG_FILE, ANALYSIS_FILE, TRIAGE_FILE]);
        for f in &manifest.files {
            assert!(bundle.path(f).exists(), "{} missing", f);
        }
        assert!(!bundle.path(DECISION_FILE).exists());
        assert!(bundle.firmware_dir().is_dir());

        let read = bundle.read_manifest().unwrap();
        assert_eq!(read, manifest);
        assert_eq!(read.status, Some(AttemptStatus::Failed));
        assert_eq!(read.serial_endpoint.as_deref(), Some("sim://rate_hunt"));
    }

    #[tokio::test]
    async fn test_finalize_is_write_once() {
        let root = TempDir::new().unwrap();
        let case = builtin_cases().remove("rate_hunt").unwrap();
        let bundle = RunBundle::create(root.path(), "run_bundle_test").await.unwrap();
        let mut attempt = attempt();
        attempt.fail_at(Stage::Build, "exit code 2");

        let manifest = bundle.finalize(&attempt, &case, None).await.unwrap();
        assert_eq!(manifest.error.as_ref().map(|e| e.stage), Some(Stage::Build));
        assert!(bundle.finalize(&attempt, &case, None).await.is_err());
    }
}
