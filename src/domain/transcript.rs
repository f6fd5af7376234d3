//! Transcript - the timestamped serial evidence for one attempt.
//!
//! Line protocol (plain text, newline terminated):
//! - `RUN_START <run_id>` opens a run
//! - `ERROR <code> <message>` reports a failure
//! - `INFO ...` is informational
//! - `RUN_END <run_id>` closes a run
//!
//! A transcript is appended to only while serial capture owns it; afterwards
//! it is read-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::format_ts;

pub const RUN_START: &str = "RUN_START";
pub const RUN_END: &str = "RUN_END";
pub const ERROR: &str = "ERROR";
pub const INFO: &str = "INFO";

/// One captured line with its local capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub ts: DateTime<Utc>,
    pub line: String,
}

/// Classification of a raw protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind<'a> {
    RunStart(&'a str),
    RunEnd(&'a str),
    Error { code: &'a str, message: &'a str },
    Info(&'a str),
    Other,
}

/// Classify a raw line. Markers may appear anywhere in the line (serial noise
/// before a marker is common right after boot); errors and info must lead.
pub fn classify(line: &str) -> LineKind<'_> {
    let trimmed = line.trim();
    let mut tokens = trimmed.split_whitespace();
    match tokens.next() {
        Some(ERROR) => {
            let rest = trimmed[ERROR.len()..].trim_start();
            let (code, message) = match rest.split_once(char::is_whitespace) {
                Some((code, message)) => (code, message.trim()),
                None => (rest, ""),
            };
            return LineKind::Error { code, message };
        }
        Some(INFO) => return LineKind::Info(trimmed[INFO.len()..].trim_start()),
        _ => {}
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    for (i, tok) in tokens.iter().enumerate() {
        let id = tokens.get(i + 1).copied().unwrap_or("");
        if tok.ends_with(RUN_START) {
            return LineKind::RunStart(id);
        }
        if tok.ends_with(RUN_END) {
            return LineKind::RunEnd(id);
        }
    }
    LineKind::Other
}

/// True when `line` carries a run-end marker for `expected` (any run when `None`).
pub fn is_run_end_for(line: &str, expected: Option<&str>) -> bool {
    match classify(line) {
        LineKind::RunEnd(id) => expected.is_none_or(|e| e == id),
        _ => false,
    }
}

/// Ordered, timestamped serial transcript bounded by run markers or a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    expected_run_id: Option<String>,
    lines: Vec<TranscriptLine>,
    timed_out: bool,
}

impl Transcript {
    /// Start an empty transcript for acquisition.
    pub fn open(expected_run_id: Option<String>) -> Self {
        Self {
            expected_run_id,
            lines: Vec::new(),
            timed_out: false,
        }
    }

    /// Build a finished transcript from already-stamped lines.
    pub fn from_lines(expected_run_id: Option<String>, lines: Vec<TranscriptLine>, timed_out: bool) -> Self {
        Self {
            expected_run_id,
            lines,
            timed_out,
        }
    }

    pub(crate) fn push(&mut self, ts: DateTime<Utc>, line: impl Into<String>) {
        self.lines.push(TranscriptLine { ts, line: line.into() });
    }

    pub(crate) fn mark_timed_out(&mut self) {
        self.timed_out = true;
    }

    pub fn expected_run_id(&self) -> Option<&str> {
        self.expected_run_id.as_deref()
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whether acquisition stopped on the deadline rather than a run-end marker.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Render as `uart.log`: one `<rfc3339-ms> <line>` per line.
    pub fn to_log(&self) -> String {
        let mut out = String::new();
        for l in &self.lines {
            out.push_str(&format_ts(&l.ts));
            out.push(' ');
            out.push_str(&l.line);
            out.push('\n');
        }
        out
    }

    /// Read a `uart.log` back. Lines whose timestamp does not parse are rejected.
    pub fn parse_log(text: &str, expected_run_id: Option<String>) -> Result<Self, String> {
        let mut lines = Vec::new();
        for (n, raw) in text.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let (ts, line) = raw.split_once(' ').unwrap_or((raw, ""));
            let ts = DateTime::parse_from_rfc3339(ts)
                .map_err(|e| format!("line {}: bad timestamp '{}': {}", n + 1, ts, e))?
                .with_timezone(&Utc);
            lines.push(TranscriptLine {
                ts,
                line: line.to_string(),
            });
        }
        let ended = lines
            .iter()
            .any(|l| is_run_end_for(&l.line, expected_run_id.as_deref()));
        let timed_out = !ended;
        Ok(Self {
            expected_run_id,
            lines,
            timed_out,
        })
    }
}
