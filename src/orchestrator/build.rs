//! Firmware build stage.
//!
//! The build tool is opaque: it is run, its exit status checked, and the
//! configured image path inspected. Mock mode writes placeholder artifacts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::RunnerConfig;
use crate::domain::{ExperimentParams, ParamValue};
use crate::error::{HilError, Result};
use crate::flash::tool::tail;

/// Inputs to one build.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub case_id: &'a str,
    pub run_id: &'a str,
    pub params: &'a ExperimentParams,
    /// Bundle directory the artifacts are copied into
    pub firmware_dir: &'a Path,
}

/// Reference to a built artifact inside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// Where the build produced it, before the bundle copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifacts {
    pub image: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elf: Option<ArtifactRef>,
    pub placeholder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
}

#[async_trait]
pub trait FirmwareBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<BuildArtifacts>;
}

async fn artifact_ref(path: &Path, source: Option<&Path>) -> Result<ArtifactRef> {
    let bytes = tokio::fs::read(path).await?;
    Ok(ArtifactRef {
        path: path.to_path_buf(),
        source: source.map(Path::to_path_buf),
        sha256: hex::encode(Sha256::digest(&bytes)),
        bytes: bytes.len() as u64,
    })
}

/// Mock-mode builder: writes recognizable stub artifacts.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderBuilder;

#[async_trait]
impl FirmwareBuilder for PlaceholderBuilder {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<BuildArtifacts> {
        let meta = serde_json::json!({
            "case_id": request.case_id,
            "run_id": request.run_id,
            "params": request.params,
        });
        let image = request.firmware_dir.join(format!("{}.uf2", request.case_id));
        let elf = request.firmware_dir.join(format!("{}.elf", request.case_id));
        tokio::fs::write(&image, format!("UF2_PLACEHOLDER\n{}\n", meta)).await?;
        tokio::fs::write(&elf, format!("ELF_PLACEHOLDER\n{}\n", meta)).await?;
        debug!(image = %image.display(), "Wrote placeholder artifacts");

        Ok(BuildArtifacts {
            image: artifact_ref(&image, None).await?,
            elf: Some(artifact_ref(&elf, None).await?),
            placeholder: true,
            log_tail: None,
        })
    }
}

/// Environment handed to the build command.
pub fn build_env(case_id: &str, run_id: &str, params: &ExperimentParams) -> Vec<(String, String)> {
    let mut env = vec![
        ("HIL_CASE_ID".to_string(), case_id.to_string()),
        ("HIL_RUN_ID".to_string(), run_id.to_string()),
    ];
    for (key, value) in params.iter() {
        let name = format!("HIL_PARAM_{}", key.to_ascii_uppercase());
        if let ParamValue::Int(v) = value {
            env.push((format!("{}_HEX", name), format!("0x{:X}", v)));
        }
        env.push((name, value.to_string()));
    }
    env
}

/// Real-mode builder: runs the configured shell command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: Option<String>,
    cwd: PathBuf,
    timeout: Duration,
    image_path: Option<PathBuf>,
    elf_path: Option<PathBuf>,
}

impl CommandBuilder {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            command: config.build_cmd.clone(),
            cwd: config.build_cwd.clone(),
            timeout: Duration::from_millis(config.build_timeout_ms),
            image_path: config.image_path.clone(),
            elf_path: config.elf_path.clone(),
        }
    }

    async fn run_command(&self, command: &str, request: &BuildRequest<'_>) -> Result<String> {
        let command = command.replace("{case_id}", request.case_id);
        info!(command = %command, cwd = %self.cwd.display(), "Running firmware build");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&self.cwd)
            .envs(build_env(request.case_id, request.run_id, request.params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| HilError::Configuration(format!("cannot start build command: {}", e)))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HilError::Build(format!("timed out after {}ms", self.timeout.as_millis())))??;

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(HilError::Build(format!(
                "exit code {:?}: {}",
                output.status.code(),
                tail(&combined, 6)
            )));
        }
        Ok(tail(&combined, 6))
    }

    async fn copy_into(&self, source: &Path, dir: &Path) -> Result<ArtifactRef> {
        let name = source
            .file_name()
            .ok_or_else(|| HilError::Configuration(format!("artifact path has no file name: {}", source.display())))?;
        let dest = dir.join(name);
        tokio::fs::copy(source, &dest).await?;
        artifact_ref(&dest, Some(source)).await
    }
}

#[async_trait]
impl FirmwareBuilder for CommandBuilder {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<BuildArtifacts> {
        let log_tail = match &self.command {
            Some(command) => Some(self.run_command(command, request).await?),
            None => {
                debug!("No build command configured; using prebuilt image");
                None
            }
        };

        let image_src = self
            .image_path
            .as_deref()
            .ok_or_else(|| HilError::Configuration("runner.image_path is not set".to_string()))?;
        if !image_src.exists() {
            return Err(HilError::Configuration(format!(
                "firmware image not found: {}",
                image_src.display()
            )));
        }
        let image = self.copy_into(image_src, request.firmware_dir).await?;
        let placeholder = crate::flash::is_placeholder(&image.path).await?;

        let elf = match self.elf_path.as_deref() {
            Some(src) if src.exists() => Some(self.copy_into(src, request.firmware_dir).await?),
            _ => None,
        };

        Ok(BuildArtifacts {
            image,
            elf,
            placeholder,
            log_tail,
        })
    }
}
