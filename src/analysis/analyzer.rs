//! Evidence analyzer - a pure function from transcript to analysis result.
//!
//! Nothing here reads clocks, files or randomness; the same transcript and
//! parameters always produce the same result.

use serde::{Deserialize, Serialize};

use super::signature::{SignatureEvidence, check_signature};
use crate::domain::{CaseSpec, ExperimentParams, LineKind, SearchSpace, Transcript, classify};

/// `last_error_code` recorded when capture hit its deadline without a run end.
pub const EVIDENCE_TIMEOUT_CODE: &str = "EVIDENCE_TIMEOUT";

/// Derived summary of one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub pass_fail: bool,
    pub error_count: u32,
    pub missing_start: bool,
    pub missing_end: bool,
    pub lines_per_sec: f64,
    pub max_gap_ms: u64,
    pub last_error_code: Option<String>,
    /// Semantic check outcome; `None` when the case has no semantic check
    pub validity: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureEvidence>,
    pub line_count: usize,
    pub timed_out: bool,
}

impl AnalysisResult {
    /// True when capture ended on the deadline rather than a run end.
    pub fn never_finished(&self) -> bool {
        self.last_error_code.as_deref() == Some(EVIDENCE_TIMEOUT_CODE)
    }
}

/// Case-specific check that recomputes an expected value from parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticCheck {
    Signature { key: String, payload: String },
}

/// Analyzer configured for one case.
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    semantic: Option<SemanticCheck>,
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyzer with whatever semantic check the case calls for.
    pub fn for_case(case: &CaseSpec) -> Self {
        let semantic = match &case.search {
            SearchSpace::Signature { key, payload } => Some(SemanticCheck::Signature {
                key: key.clone(),
                payload: payload.clone(),
            }),
            _ => None,
        };
        Self { semantic }
    }

    pub fn analyze(&self, transcript: &Transcript, expected: &ExperimentParams) -> AnalysisResult {
        let run_id = transcript.expected_run_id();
        let lines = transcript.lines();

        let mut error_count = 0u32;
        let mut saw_start = false;
        let mut saw_end = false;
        let mut last_error_code = None;

        for l in lines {
            match classify(&l.line) {
                LineKind::RunStart(id) => {
                    if run_id.is_none_or(|r| r == id) {
                        saw_start = true;
                    }
                }
                LineKind::RunEnd(id) => {
                    if run_id.is_none_or(|r| r == id) {
                        saw_end = true;
                    }
                }
                LineKind::Error { code, .. } => {
                    error_count += 1;
                    last_error_code = if code.is_empty() { None } else { Some(code.to_string()) };
                }
                LineKind::Info(_) | LineKind::Other => {}
            }
        }

        if transcript.timed_out() && !saw_end {
            last_error_code = Some(EVIDENCE_TIMEOUT_CODE.to_string());
        }

        let mut max_gap_ms = 0u64;
        for pair in lines.windows(2) {
            let gap = (pair[1].ts - pair[0].ts).num_milliseconds().max(0) as u64;
            max_gap_ms = max_gap_ms.max(gap);
        }

        let lines_per_sec = match (lines.first(), lines.last()) {
            (Some(first), Some(last)) => {
                let span_ms = (last.ts - first.ts).num_milliseconds();
                if span_ms > 0 {
                    lines.len() as f64 / (span_ms as f64 / 1000.0)
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let signature = match &self.semantic {
            Some(SemanticCheck::Signature { key, payload }) => {
                let expected_magic = expected.get_int(key).and_then(|v| u32::try_from(v).ok());
                Some(check_signature(lines, payload, expected_magic))
            }
            None => None,
        };
        let validity = signature.as_ref().map(|s| s.valid);

        let pass_fail = saw_start && saw_end && error_count == 0 && validity != Some(false);

        AnalysisResult {
            pass_fail,
            error_count,
            missing_start: !saw_start,
            missing_end: !saw_end,
            lines_per_sec,
            max_gap_ms,
            last_error_code,
            validity,
            signature,
            line_count: lines.len(),
            timed_out: transcript.timed_out(),
        }
    }
}

/// Analyze without any case-specific semantic check.
pub fn analyze(transcript: &Transcript, expected: &ExperimentParams) -> AnalysisResult {
    Analyzer::new().analyze(transcript, expected)
}
