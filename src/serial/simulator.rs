//! Simulated device for mock mode.
//!
//! Emits the same line protocol a real target would, judged against the
//! case's `mock_target`, and feeds it through the normal capture path.

use async_trait::async_trait;
use std::time::Duration;

use super::capture::{CaptureReport, CaptureRequest, ScriptedLines, TruthCapture, capture};
use crate::analysis::signature::expected_crc;
use crate::domain::{CODE_MISMATCH, CODE_TOO_HIGH, CODE_TOO_LOW, CaseSpec, ExperimentParams, ParamValue, SearchSpace};
use crate::error::{HilError, Result};

#[derive(Debug, Clone)]
pub struct DeviceSimulator {
    case: CaseSpec,
    target: ParamValue,
    line_delay: Duration,
    capture_timeout: Duration,
    omit_run_end: bool,
}

impl DeviceSimulator {
    /// Simulator for `case`; the case must name a mock target.
    pub fn for_case(case: &CaseSpec, capture_timeout: Duration) -> Result<Self> {
        let target = case.mock_target.clone().ok_or_else(|| {
            HilError::Configuration(format!("case '{}' has no mock_target for mock mode", case.id))
        })?;
        Ok(Self {
            case: case.clone(),
            target,
            line_delay: Duration::from_millis(2),
            capture_timeout,
            omit_run_end: false,
        })
    }

    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    /// Simulate firmware that hangs before printing its run end.
    pub fn hanging(mut self) -> Self {
        self.omit_run_end = true;
        self
    }

    /// Lines the device prints for one run.
    pub fn lines(&self, run_id: &str, params: &ExperimentParams) -> Vec<String> {
        let mut out = vec![
            format!("INFO boot case={}", self.case.id),
            format!("RUN_START {}", run_id),
        ];
        let key = self.case.search.key();

        match &self.case.search {
            SearchSpace::Range { .. } => match (params.get_int(key), self.target.as_int()) {
                (Some(guess), Some(target)) if guess > target => {
                    out.push(format!("ERROR {} {}={} exceeds device limit", CODE_TOO_HIGH, key, guess));
                }
                (Some(guess), Some(target)) if guess < target => {
                    out.push(format!("ERROR {} {}={} below device requirement", CODE_TOO_LOW, key, guess));
                }
                (Some(_), Some(_)) => out.push("INFO test_result PASS".to_string()),
                _ => out.push(format!("ERROR BAD_PARAM {} missing or not an integer", key)),
            },
            SearchSpace::Choice { .. } => match params.get(key) {
                Some(value) if *value == self.target => out.push("INFO test_result PASS".to_string()),
                Some(value) => out.push(format!("ERROR {} {}={} rejected", CODE_MISMATCH, key, value)),
                None => out.push(format!("ERROR BAD_PARAM {} missing", key)),
            },
            SearchSpace::Signature { payload, .. } => {
                let magic = self.target.as_int().and_then(|v| u32::try_from(v).ok()).unwrap_or(0);
                out.push(format!("MAGIC=0x{:08X}", magic));
                out.push(format!("CRC=0x{:08X}", expected_crc(payload, magic)));
                out.push("INFO signature emitted".to_string());
            }
        }

        if !self.omit_run_end {
            out.push(format!("RUN_END {}", run_id));
        }
        out
    }
}

#[async_trait]
impl TruthCapture for DeviceSimulator {
    async fn prepare_for_flash(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureReport> {
        let mut source = ScriptedLines::new(self.lines(&request.run_id, &request.params), self.line_delay).hold_open();
        let transcript = capture(&mut source, request.expected_run_id.as_deref(), self.capture_timeout).await;
        Ok(CaptureReport {
            endpoint: format!("sim://{}", self.case.id),
            transcript,
        })
    }
}
