//! Attempt record - one build/flash/capture/analyze/decide cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::params::ExperimentParams;
use super::transcript::Transcript;
use crate::analysis::AnalysisResult;
use crate::flash::FlashMethod;
use crate::panel::DecisionOutput;

/// Loop stage, used for progress reporting and to locate errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Flash,
    Capture,
    Analyze,
    Decide,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Build => "BUILD",
            Stage::Flash => "FLASH",
            Stage::Capture => "CAPTURE",
            Stage::Analyze => "ANALYZE",
            Stage::Decide => "DECIDE",
        };
        write!(f, "{}", s)
    }
}

/// Terminal status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Passed,
    Failed,
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Passed => "passed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Error => "error",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One pass through the loop. Frozen once its bundle is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based ordinal within the run
    pub index: u32,
    pub run_id: String,
    pub case_id: String,
    pub params: ExperimentParams,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub flash_method: Option<FlashMethod>,
    pub flash_diagnostics: Vec<String>,
    pub serial_endpoint: Option<String>,
    pub transcript: Option<Transcript>,
    pub analysis: Option<AnalysisResult>,
    pub decision: Option<DecisionOutput>,
    pub status: Option<AttemptStatus>,
    /// Stage and message of the error that ended this attempt, if any
    pub error: Option<(Stage, String)>,
}

impl Attempt {
    pub fn new(index: u32, run_id: impl Into<String>, case_id: impl Into<String>, params: ExperimentParams) -> Self {
        Self {
            index,
            run_id: run_id.into(),
            case_id: case_id.into(),
            params,
            started_at: Utc::now(),
            finished_at: None,
            flash_method: None,
            flash_diagnostics: Vec::new(),
            serial_endpoint: None,
            transcript: None,
            analysis: None,
            decision: None,
            status: None,
            error: None,
        }
    }

    /// Close the attempt with a terminal status.
    pub fn finish(&mut self, status: AttemptStatus) {
        self.status = Some(status);
        self.finished_at = Some(Utc::now());
    }

    /// Close the attempt as an error raised during `stage`.
    pub fn fail_at(&mut self, stage: Stage, message: impl Into<String>) {
        self.error = Some((stage, message.into()));
        self.finish(AttemptStatus::Error);
    }

    pub fn passed(&self) -> bool {
        self.status == Some(AttemptStatus::Passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_attempt_is_open() {
        let attempt = Attempt::new(1, "run_x", "rate_hunt", ExperimentParams::new().with("guess_rate", 50));
        assert!(attempt.status.is_none());
        assert!(attempt.finished_at.is_none());
        assert!(!attempt.passed());
    }

    #[test]
    fn test_finish_sets_status_and_time() {
        let mut attempt = Attempt::new(2, "run_y", "rate_hunt", ExperimentParams::new());
        attempt.finish(AttemptStatus::Passed);
        assert!(attempt.passed());
        assert!(attempt.finished_at.unwrap() >= attempt.started_at);
    }

    #[test]
    fn test_fail_at_records_stage() {
        let mut attempt = Attempt::new(3, "run_z", "rate_hunt", ExperimentParams::new());
        attempt.fail_at(Stage::Flash, "no strategy succeeded");
        assert_eq!(attempt.status, Some(AttemptStatus::Error));
        assert_eq!(attempt.error, Some((Stage::Flash, "no strategy succeeded".to_string())));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Capture.to_string(), "CAPTURE");
        assert_eq!(AttemptStatus::Failed.to_string(), "failed");
    }
}
