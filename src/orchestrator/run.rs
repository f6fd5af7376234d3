//! Run orchestrator - drives BUILD, FLASH, CAPTURE, ANALYZE and DECIDE per attempt.
//!
//! Attempts are strictly serial: attempt n+1 starts only after attempt n's
//! bundle is on disk, and its parameters come from attempt n's decision.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

use super::build::{BuildArtifacts, BuildRequest, CommandBuilder, FirmwareBuilder, PlaceholderBuilder};
use super::bundle::RunBundle;
use crate::analysis::{AnalysisResult, Analyzer};
use crate::config::Config;
use crate::domain::{Attempt, AttemptStatus, CaseSpec, ExperimentParams, Stage};
use crate::error::{HilError, Result};
use crate::flash::{DeviceProgrammer, FlashError, FlashMethod};
use crate::id::generate_run_id;
use crate::panel::{DecisionPanel, PanelContext};
use crate::serial::{CaptureRequest, DeviceSimulator, SerialPortCapture, TruthCapture};

/// Whether attempts touch real hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Mock,
    Real,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(RunMode::Mock),
            "real" => Ok(RunMode::Real),
            other => Err(format!("unknown mode '{}' (expected mock or real)", other)),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Mock => write!(f, "mock"),
            RunMode::Real => write!(f, "real"),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Pass,
    Exhausted,
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Pass => write!(f, "STOP_PASS"),
            StopReason::Exhausted => write!(f, "STOP_EXHAUSTED"),
            StopReason::Error => write!(f, "STOP_ERROR"),
        }
    }
}

/// The error that ended a run early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: Option<Stage>,
    pub message: String,
    pub configuration: bool,
}

/// Compact per-attempt record for progress output and `--json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub index: u32,
    pub run_id: String,
    pub status: AttemptStatus,
    pub params: ExperimentParams,
    pub error_count: Option<u32>,
    pub last_error_code: Option<String>,
    pub flash_method: Option<FlashMethod>,
    pub error: Option<String>,
    pub bundle: PathBuf,
}

impl AttemptSummary {
    fn from_attempt(attempt: &Attempt, bundle: &RunBundle) -> Self {
        Self {
            index: attempt.index,
            run_id: attempt.run_id.clone(),
            status: attempt.status.unwrap_or(AttemptStatus::Error),
            params: attempt.params.clone(),
            error_count: attempt.analysis.as_ref().map(|a| a.error_count),
            last_error_code: attempt.analysis.as_ref().and_then(|a| a.last_error_code.clone()),
            flash_method: attempt.flash_method,
            error: attempt.error.as_ref().map(|(stage, msg)| format!("{}: {}", stage, msg)),
            bundle: bundle.dir().to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub case_id: String,
    pub mode: RunMode,
    pub stop: StopReason,
    pub attempts: Vec<AttemptSummary>,
    /// Parameters of the last attempt; the passing configuration on STOP_PASS
    pub final_params: ExperimentParams,
    pub failure: Option<RunFailure>,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.stop == StopReason::Pass
    }

    /// 0 pass, 1 exhausted, 2 configuration error, 3 device or unexpected fault.
    pub fn exit_code(&self) -> i32 {
        match self.stop {
            StopReason::Pass => 0,
            StopReason::Exhausted => 1,
            StopReason::Error => match &self.failure {
                Some(f) if f.configuration => 2,
                _ => 3,
            },
        }
    }

    fn stop_with_error(&mut self, stage: Option<Stage>, err: &HilError) {
        self.stop = StopReason::Error;
        self.failure = Some(RunFailure {
            stage,
            message: err.to_string(),
            configuration: err.is_configuration(),
        });
    }
}

/// Called once per finished attempt, after its bundle is written.
pub type ProgressFn = Box<dyn Fn(&AttemptSummary) + Send + Sync>;

enum Next {
    Pass,
    Retry(ExperimentParams),
    Exhausted,
    Fatal(Stage, HilError),
}

pub struct RunOrchestrator {
    case: CaseSpec,
    mode: RunMode,
    runs_root: PathBuf,
    max_attempts: u32,
    preferred_flash: FlashMethod,
    match_run_id: bool,
    builder: Box<dyn FirmwareBuilder>,
    programmer: DeviceProgrammer,
    capture: Box<dyn TruthCapture>,
    analyzer: Analyzer,
    panel: DecisionPanel,
    progress: Option<ProgressFn>,
}

impl RunOrchestrator {
    /// Wire up every component from configuration for `case`.
    pub fn from_config(config: &Config, case: CaseSpec, mode: RunMode, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(HilError::Configuration("max_attempts must be at least 1".to_string()));
        }

        let (builder, programmer, capture, preferred_flash): (
            Box<dyn FirmwareBuilder>,
            DeviceProgrammer,
            Box<dyn TruthCapture>,
            FlashMethod,
        ) = match mode {
            RunMode::Mock => {
                let timeout = Duration::from_millis(config.serial.capture_timeout_ms);
                (
                    Box::new(PlaceholderBuilder),
                    DeviceProgrammer::simulated(),
                    Box::new(DeviceSimulator::for_case(&case, timeout)?),
                    FlashMethod::Simulated,
                )
            }
            RunMode::Real => {
                if config.runner.image_path.is_none() {
                    return Err(HilError::Configuration(
                        "runner.image_path is required in real mode".to_string(),
                    ));
                }
                (
                    Box::new(CommandBuilder::from_config(&config.runner)),
                    DeviceProgrammer::from_config(&config.flash),
                    Box::new(SerialPortCapture::from_config(&config.serial)),
                    config.runner.flash_method,
                )
            }
        };

        Ok(Self {
            analyzer: Analyzer::for_case(&case),
            case,
            mode,
            runs_root: config.paths.runs_root.clone(),
            max_attempts,
            preferred_flash,
            match_run_id: mode == RunMode::Mock || config.serial.match_run_id,
            builder,
            programmer,
            capture,
            panel: DecisionPanel::from_config(&config.panel),
            progress: None,
        })
    }

    pub fn with_builder(mut self, builder: Box<dyn FirmwareBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_programmer(mut self, programmer: DeviceProgrammer) -> Self {
        self.programmer = programmer;
        self
    }

    pub fn with_capture(mut self, capture: Box<dyn TruthCapture>) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_panel(mut self, panel: DecisionPanel) -> Self {
        self.panel = panel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn case(&self) -> &CaseSpec {
        &self.case
    }

    /// Run the loop from the case's initial parameters with `overrides` applied.
    pub async fn run(&self, overrides: &ExperimentParams) -> RunOutcome {
        let mut params = self.case.initial_params().merged(overrides);
        let mut outcome = RunOutcome {
            case_id: self.case.id.clone(),
            mode: self.mode,
            stop: StopReason::Exhausted,
            attempts: Vec::new(),
            final_params: params.clone(),
            failure: None,
        };
        if let Err(e) = self.case.validate(&params) {
            outcome.stop_with_error(None, &HilError::Configuration(format!("invalid parameters: {}", e)));
            return outcome;
        }

        info!(
            case = %self.case.id,
            mode = %self.mode,
            max_attempts = self.max_attempts,
            params = %params,
            "Starting run"
        );

        let mut history: Vec<AnalysisResult> = Vec::new();
        for index in 1..=self.max_attempts {
            outcome.final_params = params.clone();
            let run_id = generate_run_id();
            let bundle = match RunBundle::create(&self.runs_root, &run_id).await {
                Ok(b) => b,
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Cannot create run bundle");
                    outcome.stop_with_error(None, &e);
                    return outcome;
                }
            };

            let mut attempt = Attempt::new(index, &run_id, &self.case.id, params.clone());
            let mut firmware = None;
            let next = self.drive(&mut attempt, &bundle, &mut firmware, &history).await;

            if let Err(e) = bundle.finalize(&attempt, &self.case, firmware.as_ref()).await {
                error!(run_id = %run_id, error = %e, "Cannot finalize run bundle");
                outcome.stop_with_error(None, &e);
                return outcome;
            }

            let summary = AttemptSummary::from_attempt(&attempt, &bundle);
            if let Some(progress) = &self.progress {
                progress(&summary);
            }
            outcome.attempts.push(summary);
            if let Some(analysis) = attempt.analysis {
                history.push(analysis);
            }

            match next {
                Next::Pass => {
                    info!(run_id = %run_id, attempt = index, params = %params, "Run passed");
                    outcome.stop = StopReason::Pass;
                    return outcome;
                }
                Next::Exhausted => break,
                Next::Fatal(stage, err) => {
                    error!(run_id = %run_id, stage = %stage, error = %err, "Run stopped on fatal error");
                    outcome.stop_with_error(Some(stage), &err);
                    return outcome;
                }
                Next::Retry(next_params) => params = next_params,
            }
        }

        warn!(case = %self.case.id, attempts = self.max_attempts, "Attempts exhausted without a pass");
        outcome.stop = StopReason::Exhausted;
        outcome
    }

    async fn drive(
        &self,
        attempt: &mut Attempt,
        bundle: &RunBundle,
        firmware: &mut Option<BuildArtifacts>,
        history: &[AnalysisResult],
    ) -> Next {
        info!(run_id = %attempt.run_id, attempt = attempt.index, params = %attempt.params, "Attempt started");

        let firmware_dir = bundle.firmware_dir();
        let request = BuildRequest {
            case_id: &self.case.id,
            run_id: &attempt.run_id,
            params: &attempt.params,
            firmware_dir: &firmware_dir,
        };
        let image = match self.builder.build(&request).await {
            Ok(artifacts) => {
                let image = artifacts.image.path.clone();
                *firmware = Some(artifacts);
                image
            }
            Err(e) => return self.stage_error(attempt, Stage::Build, e),
        };

        let mut excluded = Vec::new();
        if let Err(reason) = self.capture.prepare_for_flash().await {
            warn!(run_id = %attempt.run_id, reason = %reason, "Pre-flash handshake failed; skipping mass storage");
            attempt.flash_diagnostics.push(format!("handshake: {}", reason));
            excluded.push(FlashMethod::MassStorage);
        }
        match self.programmer.flash(&image, self.preferred_flash, &excluded).await {
            Ok(report) => {
                attempt.flash_method = Some(report.method);
                attempt.flash_diagnostics.extend(report.diagnostics);
            }
            Err(e) => {
                if let FlashError::Exhausted(failures) = &e {
                    attempt.flash_diagnostics.extend(failures.iter().map(|f| f.to_string()));
                }
                return self.stage_error(attempt, Stage::Flash, e.into());
            }
        }

        let request = CaptureRequest {
            run_id: attempt.run_id.clone(),
            expected_run_id: self.match_run_id.then(|| attempt.run_id.clone()),
            params: attempt.params.clone(),
        };
        let report = match self.capture.capture(&request).await {
            Ok(report) => report,
            Err(e) => return self.stage_error(attempt, Stage::Capture, e),
        };
        attempt.serial_endpoint = Some(report.endpoint);

        let analysis = self.analyzer.analyze(&report.transcript, &attempt.params);
        attempt.transcript = Some(report.transcript);
        info!(
            run_id = %attempt.run_id,
            pass = analysis.pass_fail,
            errors = analysis.error_count,
            last_error_code = analysis.last_error_code.as_deref().unwrap_or("none"),
            "Attempt analyzed"
        );
        if analysis.pass_fail {
            attempt.analysis = Some(analysis);
            attempt.finish(AttemptStatus::Passed);
            return Next::Pass;
        }

        let ctx = PanelContext {
            case: &self.case,
            current: &attempt.params,
            analysis: &analysis,
            history,
            attempt: attempt.index,
            max_attempts: self.max_attempts,
        };
        let decision = self.panel.decide(&ctx).await;
        let next_params = decision.next_params.clone();
        attempt.analysis = Some(analysis);
        attempt.decision = Some(decision);
        attempt.finish(AttemptStatus::Failed);

        if attempt.index >= self.max_attempts {
            Next::Exhausted
        } else {
            Next::Retry(next_params)
        }
    }

    fn stage_error(&self, attempt: &mut Attempt, stage: Stage, err: HilError) -> Next {
        attempt.fail_at(stage, err.to_string());
        if !err.is_transient() {
            return Next::Fatal(stage, err);
        }
        warn!(run_id = %attempt.run_id, stage = %stage, error = %err, "Transient device error; retrying same parameters");
        if attempt.index >= self.max_attempts {
            Next::Exhausted
        } else {
            Next::Retry(attempt.params.clone())
        }
    }
}
