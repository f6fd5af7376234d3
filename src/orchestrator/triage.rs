//! Human-readable triage note for one attempt.

use std::fmt::Write;

use crate::analysis::AnalysisResult;
use crate::domain::{Attempt, CODE_MISMATCH, CODE_TOO_HIGH, CODE_TOO_LOW, CaseSpec, LineKind, Stage, classify};
use crate::panel::{Role, proposal_bullet};

const MAX_CITATIONS: usize = 12;

fn stage_hypothesis(stage: Stage) -> &'static str {
    match stage {
        Stage::Build => "The firmware build command failed or produced no image.",
        Stage::Flash => "No programming path reached the device; check the bootloader volume and flasher tools.",
        Stage::Capture => "The serial endpoint did not come back after flashing.",
        Stage::Analyze | Stage::Decide => "The loop itself failed after evidence was captured.",
    }
}

/// Candidate explanations, most specific first.
pub fn hypotheses(attempt: &Attempt, case: &CaseSpec) -> Vec<String> {
    let mut out = Vec::new();
    if let Some((stage, message)) = &attempt.error {
        out.push(format!("{} ({}: {})", stage_hypothesis(*stage), stage, message));
    }
    let Some(a) = &attempt.analysis else {
        return out;
    };
    if a.pass_fail {
        out.push("Evidence satisfies the pass condition.".to_string());
        return out;
    }

    let key = case.search.key();
    let value = attempt.params.get(key).map(|v| v.to_string()).unwrap_or_default();
    if a.missing_start {
        out.push("Firmware never printed RUN_START for this run: boot failure, stale image or wrong endpoint.".to_string());
    }
    match a.last_error_code.as_deref() {
        Some(_) if a.never_finished() => {
            out.push("Run never finished: firmware hang or a capture deadline that is too short.".to_string())
        }
        Some(CODE_TOO_HIGH) => out.push(format!("{}={} is above what the device accepts.", key, value)),
        Some(CODE_TOO_LOW) => out.push(format!("{}={} is below what the device requires.", key, value)),
        Some(CODE_MISMATCH) => out.push(format!("{}={} does not match the device configuration.", key, value)),
        Some(code) => out.push(format!("Firmware reported error code {}.", code)),
        None => {}
    }
    if a.validity == Some(false) {
        out.push(signature_hypothesis(a, &value));
    }
    if out.is_empty() {
        out.push("Run completed without a recognizable failure; inspect uart.log.".to_string());
    }
    out
}

fn signature_hypothesis(a: &AnalysisResult, value: &str) -> String {
    match &a.signature {
        Some(sig) if sig.reported_magic.is_none() || sig.reported_crc.is_none() => {
            "Firmware did not report a complete MAGIC/CRC signature.".to_string()
        }
        Some(sig) if sig.self_consistent => format!(
            "Device reports a self-consistent signature 0x{:08X} that differs from the expected {}.",
            sig.reported_magic.unwrap_or_default(),
            value
        ),
        _ => "Reported signature is not self-consistent; suspect corrupted output or a wrong payload.".to_string(),
    }
}

/// `uart.log` line citations for markers, errors and signature lines.
pub fn citations(attempt: &Attempt) -> Vec<String> {
    let Some(transcript) = &attempt.transcript else {
        return Vec::new();
    };
    transcript
        .lines()
        .iter()
        .enumerate()
        .filter(|(_, l)| {
            let cited = matches!(
                classify(&l.line),
                LineKind::RunStart(_) | LineKind::RunEnd(_) | LineKind::Error { .. }
            );
            cited || l.line.starts_with("MAGIC=") || l.line.starts_with("CRC=")
        })
        .take(MAX_CITATIONS)
        .map(|(i, l)| format!("- uart.log:{} `{}`", i + 1, l.line.trim()))
        .collect()
}

/// Render `triage.md`.
pub fn render(attempt: &Attempt, case: &CaseSpec) -> String {
    let mut out = String::new();
    let status = attempt.status.map(|s| s.to_string()).unwrap_or_else(|| "incomplete".to_string());
    let _ = writeln!(out, "# Triage: {}\n", attempt.run_id);
    let _ = writeln!(out, "- case: {}", case.id);
    let _ = writeln!(out, "- attempt: {}", attempt.index);
    let _ = writeln!(out, "- status: {}", status);
    let _ = writeln!(out, "- params: {}", attempt.params);
    if let Some(method) = attempt.flash_method {
        let _ = writeln!(out, "- flash: {}", method);
    }
    if let Some(endpoint) = &attempt.serial_endpoint {
        let _ = writeln!(out, "- serial: {}", endpoint);
    }

    let _ = writeln!(out, "\n## Hypotheses\n");
    for h in hypotheses(attempt, case) {
        let _ = writeln!(out, "- {}", h);
    }

    let _ = writeln!(out, "\n## Evidence\n");
    if let Some(a) = &attempt.analysis {
        let _ = writeln!(
            out,
            "- lines={} errors={} missing_start={} missing_end={} max_gap_ms={} last_error_code={}",
            a.line_count,
            a.error_count,
            a.missing_start,
            a.missing_end,
            a.max_gap_ms,
            a.last_error_code.as_deref().unwrap_or("none")
        );
    }
    let cites = citations(attempt);
    if cites.is_empty() && attempt.analysis.is_none() {
        let _ = writeln!(out, "- no transcript captured");
    }
    for c in cites {
        let _ = writeln!(out, "{}", c);
    }
    for d in &attempt.flash_diagnostics {
        let _ = writeln!(out, "- flash: {}", d);
    }

    let _ = writeln!(out, "\n## Next experiment\n");
    if attempt.passed() {
        let _ = writeln!(out, "None. Passing configuration: {}", attempt.params);
    } else if let Some(decision) = &attempt.decision {
        let _ = writeln!(out, "{}\n", proposal_bullet(&decision.next_params));
        if let Some(summary) = decision.rationale(Role::Summarizer) {
            for line in summary.lines().filter(|l| !l.trim().is_empty()).take(4) {
                let _ = writeln!(out, "> {}", line.trim());
            }
        }
        if decision.fallback_count() > 0 {
            let _ = writeln!(out, "\n{} of 5 roles used their deterministic fallback.", decision.fallback_count());
        }
        if let Some(coder) = decision.rationale(Role::Coder) {
            let _ = writeln!(out, "\n### Instrumentation (advisory)\n\n{}", coder.trim());
        }
    } else if let Some((stage, _)) = &attempt.error {
        let _ = writeln!(out, "Fix the {} error above, then re-run with the same parameters.", stage);
    } else {
        let _ = writeln!(out, "No decision recorded.");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;
    use crate::domain::{AttemptStatus, ExperimentParams, Transcript, TranscriptLine, builtin_cases};
    use chrono::Utc;

    fn transcript(lines: &[&str]) -> Transcript {
        let lines = lines
            .iter()
            .map(|l| TranscriptLine {
                ts: Utc::now(),
                line: l.to_string(),
            })
            .collect();
        Transcript::from_lines(Some("r1".into()), lines, false)
    }

    fn attempt_with(lines: &[&str], params: ExperimentParams) -> Attempt {
        let mut attempt = Attempt::new(1, "r1", "rate_hunt", params);
        let t = transcript(lines);
        attempt.analysis = Some(analyze(&t, &attempt.params));
        attempt.transcript = Some(t);
        attempt
    }

    #[test]
    fn test_too_high_hypothesis_and_citations() {
        let case = builtin_cases().remove("rate_hunt").unwrap();
        let mut attempt = attempt_with(
            &["INFO boot", "RUN_START r1", "ERROR TOO_HIGH nope", "RUN_END r1"],
            case.initial_params(),
        );
        attempt.finish(AttemptStatus::Failed);

        let hyps = hypotheses(&attempt, &case);
        assert_eq!(hyps, vec!["guess_rate=50 is above what the device accepts.".to_string()]);

        let cites = citations(&attempt);
        assert_eq!(cites.len(), 3);
        assert_eq!(cites[1], "- uart.log:3 `ERROR TOO_HIGH nope`");

        let md = render(&attempt, &case);
        assert!(md.starts_with("# Triage: r1"));
        assert!(md.contains("## Hypotheses"));
        assert!(md.contains("No decision recorded."));
    }

    #[test]
    fn test_timeout_hypothesis() {
        let case = builtin_cases().remove("rate_hunt").unwrap();
        let mut attempt = Attempt::new(2, "r1", "rate_hunt", case.initial_params());
        let t = Transcript::from_lines(Some("r1".into()), Vec::new(), true);
        attempt.analysis = Some(analyze(&t, &attempt.params));
        attempt.transcript = Some(t);
        let hyps = hypotheses(&attempt, &case);
        assert!(hyps.iter().any(|h| h.contains("RUN_START")));
        assert!(hyps.iter().any(|h| h.starts_with("Run never finished")));
    }

    #[test]
    fn test_error_attempt_without_transcript() {
        let case = builtin_cases().remove("rate_hunt").unwrap();
        let mut attempt = Attempt::new(1, "r9", "rate_hunt", case.initial_params());
        attempt.fail_at(Stage::Flash, "mass_storage: no volume");
        let md = render(&attempt, &case);
        assert!(md.contains("No programming path reached the device"));
        assert!(md.contains("no transcript captured"));
        assert!(md.contains("Fix the FLASH error"));
    }

    #[test]
    fn test_passed_attempt() {
        let case = builtin_cases().remove("rate_hunt").unwrap();
        let params = case.initial_params().with("guess_rate", 42);
        let mut attempt = attempt_with(&["RUN_START r1", "INFO test_result PASS", "RUN_END r1"], params);
        attempt.finish(AttemptStatus::Passed);
        let md = render(&attempt, &case);
        assert!(md.contains("Evidence satisfies the pass condition."));
        assert!(md.contains("None. Passing configuration"));
    }
}
