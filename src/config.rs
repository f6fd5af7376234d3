use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::domain::{CaseSpec, builtin_cases};
use crate::flash::FlashMethod;

/// Environment variable overriding `panel.chat_url`.
pub const ENV_CHAT_URL: &str = "HILLOOP_CHAT_URL";
/// Environment variable overriding `panel.model`.
pub const ENV_MODEL: &str = "HILLOOP_MODEL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default `env_logger` filter; `RUST_LOG` still wins
    pub log_level: Option<String>,
    pub paths: PathsConfig,
    pub runner: RunnerConfig,
    pub flash: FlashConfig,
    pub serial: SerialConfig,
    pub panel: PanelConfig,
    /// Extra or overriding cases, keyed by id
    pub cases: BTreeMap<String, CaseSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub runs_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runs_root: PathBuf::from("runs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Shell command producing the firmware image; `{case_id}` is substituted
    pub build_cmd: Option<String>,
    pub build_cwd: PathBuf,
    pub build_timeout_ms: u64,
    pub image_path: Option<PathBuf>,
    pub elf_path: Option<PathBuf>,
    pub flash_method: FlashMethod,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            build_cmd: None,
            build_cwd: PathBuf::from("."),
            build_timeout_ms: 600000,
            image_path: None,
            elf_path: None,
            flash_method: FlashMethod::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub strategy_timeout_ms: u64,
    pub mount_roots: Vec<PathBuf>,
    pub volume_labels: Vec<String>,
    pub picotool_bin: String,
    pub openocd_bin: String,
    /// Debug-probe interface description; the probe is unusable without it
    pub openocd_cfg: Option<PathBuf>,
}

fn default_mount_roots() -> Vec<PathBuf> {
    let mut roots = vec![PathBuf::from("/Volumes"), PathBuf::from("/media"), PathBuf::from("/run/media")];
    if let Ok(user) = std::env::var("USER") {
        roots.push(PathBuf::from("/media").join(&user));
        roots.push(PathBuf::from("/run/media").join(&user));
    }
    roots
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_ms: 30000,
            mount_roots: default_mount_roots(),
            volume_labels: ["RPI-RP2", "RPI_RP2", "PICO2", "RP2350"]
                .into_iter()
                .map(String::from)
                .collect(),
            picotool_bin: "picotool".to_string(),
            openocd_bin: "openocd".to_string(),
            openocd_cfg: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Fixed port; skips discovery
    pub port: Option<PathBuf>,
    pub prefer_by_id: bool,
    pub by_id_dir: PathBuf,
    pub patterns: Vec<String>,
    /// Baud rate when the attempt does not choose one through `guess_baud`
    pub baud: u32,
    /// Put the tty into raw mode at the capture baud before reading
    pub configure_port: bool,
    pub capture_timeout_ms: u64,
    pub reenumeration_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Line written before flashing to request the bootloader
    pub handshake: Option<String>,
    /// Stop only on `RUN_END <run_id>` for this attempt's run id
    pub match_run_id: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            prefer_by_id: true,
            by_id_dir: PathBuf::from("/dev/serial/by-id"),
            patterns: vec![
                "/dev/ttyACM*".to_string(),
                "/dev/ttyUSB*".to_string(),
                "/dev/cu.usbmodem*".to_string(),
            ],
            baud: 115_200,
            configure_port: true,
            capture_timeout_ms: 8000,
            reenumeration_timeout_ms: 8000,
            poll_interval_ms: 250,
            handshake: Some("BOOTSEL".to_string()),
            match_run_id: false,
        }
    }
}

/// How the decision panel schedules its roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    FanOut,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "fan_out" | "fanout" | "parallel" => Ok(ExecutionMode::FanOut),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::FanOut => write!(f, "fan_out"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// When false every role uses its deterministic fallback
    pub enabled: bool,
    pub chat_url: String,
    pub model: String,
    pub execution_mode: ExecutionMode,
    pub role_timeout_ms: u64,
    pub panel_budget_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub rework_rounds: u32,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chat_url: "http://localhost:8000/v1/chat/completions".to_string(),
            model: "local-model".to_string(),
            execution_mode: ExecutionMode::Sequential,
            role_timeout_ms: 3000,
            panel_budget_ms: 20000,
            max_tokens: 512,
            temperature: 0.2,
            rework_rounds: 1,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            paths: PathsConfig::default(),
            runner: RunnerConfig::default(),
            flash: FlashConfig::default(),
            serial: SerialConfig::default(),
            panel: PanelConfig::default(),
            cases: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply reasoning endpoint overrides from the environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_CHAT_URL).filter(|v| !v.is_empty()) {
            log::debug!("{} overrides panel.chat_url", ENV_CHAT_URL);
            self.panel.chat_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            log::debug!("{} overrides panel.model", ENV_MODEL);
            self.panel.model = model;
        }
    }

    /// Built-in cases with configured cases layered on top.
    pub fn case_catalogue(&self) -> BTreeMap<String, CaseSpec> {
        let mut cases = builtin_cases();
        for (id, case) in &self.cases {
            let mut case = case.clone();
            case.id = id.clone();
            cases.insert(id.clone(), case);
        }
        cases
    }

    pub fn case(&self, id: &str) -> Option<CaseSpec> {
        self.case_catalogue().remove(id)
    }

    /// Filter string for the logger, `info` when unset.
    pub fn log_filter(&self) -> &str {
        self.log_level.as_deref().filter(|l| !l.trim().is_empty()).unwrap_or("info")
    }
}
