//! Evidence prompt shared by every role, and per-role input assembly.

use std::fmt::Write;

use super::role::RoleOutput;
use crate::analysis::AnalysisResult;
use crate::domain::{CaseSpec, ExperimentParams, ParamValue};

/// Everything a role may look at when deciding the next experiment.
#[derive(Debug, Clone, Copy)]
pub struct PanelContext<'a> {
    pub case: &'a CaseSpec,
    /// Parameters of the attempt that just failed
    pub current: &'a ExperimentParams,
    /// Analysis of the attempt that just failed
    pub analysis: &'a AnalysisResult,
    /// Earlier analyses, oldest first, for narrative context only
    pub history: &'a [AnalysisResult],
    pub attempt: u32,
    pub max_attempts: u32,
}

fn dict_literal(params: &ExperimentParams) -> String {
    let items: Vec<String> = params
        .iter()
        .map(|(k, v)| match v {
            ParamValue::Int(i) => format!("'{}': {}", k, i),
            ParamValue::Text(t) => format!("'{}': '{}'", k, t),
        })
        .collect();
    format!("{{{}}}", items.join(", "))
}

/// Render parameters as the bullet format roles are asked to emit.
pub fn proposal_bullet(params: &ExperimentParams) -> String {
    format!("- {}", dict_literal(params))
}

/// The evidence digest every role receives.
pub fn evidence_prompt(ctx: &PanelContext<'_>) -> String {
    let a = ctx.analysis;
    let mut out = String::new();
    let _ = writeln!(out, "[case]");
    let _ = writeln!(out, "id: {}", ctx.case.id);
    if !ctx.case.description.is_empty() {
        let _ = writeln!(out, "description: {}", ctx.case.description);
    }
    let _ = writeln!(out, "search: {}", ctx.case.search.describe());
    let _ = writeln!(out, "attempt: {} of {}", ctx.attempt, ctx.max_attempts);
    let _ = writeln!(out, "\n[current_params]\n{}", dict_literal(ctx.current));
    let _ = writeln!(out, "\n[analysis]");
    let _ = writeln!(out, "pass_fail: {}", a.pass_fail);
    let _ = writeln!(out, "error_count: {}", a.error_count);
    let _ = writeln!(out, "missing_start: {}", a.missing_start);
    let _ = writeln!(out, "missing_end: {}", a.missing_end);
    let _ = writeln!(out, "lines: {}", a.line_count);
    let _ = writeln!(out, "lines_per_sec: {:.2}", a.lines_per_sec);
    let _ = writeln!(out, "max_gap_ms: {}", a.max_gap_ms);
    let _ = writeln!(out, "last_error_code: {}", a.last_error_code.as_deref().unwrap_or("none"));
    if let Some(valid) = a.validity {
        let _ = writeln!(out, "validity: {}", valid);
    }
    if let Some(sig) = &a.signature {
        let fmt_hex = |v: Option<u32>| v.map(|x| format!("0x{:08X}", x)).unwrap_or_else(|| "none".into());
        let _ = writeln!(
            out,
            "signature: reported_magic={} reported_crc={} self_consistent={}",
            fmt_hex(sig.reported_magic),
            fmt_hex(sig.reported_crc),
            sig.self_consistent
        );
    }
    if !ctx.history.is_empty() {
        let _ = writeln!(out, "\n[history]");
        for (i, h) in ctx.history.iter().enumerate() {
            let _ = writeln!(
                out,
                "attempt {}: pass={} errors={} last_error_code={}",
                i + 1,
                h.pass_fail,
                h.error_count,
                h.last_error_code.as_deref().unwrap_or("none")
            );
        }
    }
    out
}

/// Evidence followed by the outputs of earlier roles in the same round.
pub fn role_input(evidence: &str, prior: &[&RoleOutput]) -> String {
    let mut out = evidence.to_string();
    for p in prior {
        let _ = write!(out, "\n[{}]\n{}\n", p.role, p.text);
    }
    out
}

/// Input for a coder or critic rework pass.
pub fn rework_input(evidence: &str, summary: &RoleOutput, reason: &str, round: u32) -> String {
    format!(
        "The summarizer requested a focused rework: {}\n\n[summary_round_{}]\n{}\n\n[original_evidence]\n{}",
        reason, round, summary.text, evidence
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;
    use crate::domain::{Transcript, builtin_cases};
    use crate::panel::role::Role;

    #[test]
    fn test_proposal_bullet_roundtrips_through_parser() {
        let params = ExperimentParams::new().with("guess_frame", "7E1").with("guess_rate", 42);
        let bullet = proposal_bullet(&params);
        assert_eq!(bullet, "- {'guess_frame': '7E1', 'guess_rate': 42}");
        assert_eq!(crate::domain::parse_proposals(&bullet), vec![params]);
    }

    #[test]
    fn test_evidence_prompt_contents() {
        let case = builtin_cases().remove("rate_hunt").unwrap();
        let current = case.initial_params();
        let analysis = analyze(&Transcript::open(Some("r1".into())), &current);
        let ctx = PanelContext {
            case: &case,
            current: &current,
            analysis: &analysis,
            history: &[],
            attempt: 1,
            max_attempts: 8,
        };
        let text = evidence_prompt(&ctx);
        assert!(text.contains("search: guess_rate in [1, 100]"));
        assert!(text.contains("attempt: 1 of 8"));
        assert!(text.contains("'guess_rate': 50"));
        assert!(text.contains("missing_end: true"));
        assert!(!text.contains("[history]"));
    }

    #[test]
    fn test_role_input_appends_prior_outputs() {
        let planner = RoleOutput::backend(Role::Planner, "- {'guess_rate': 30}");
        let text = role_input("EVIDENCE", &[&planner]);
        assert!(text.starts_with("EVIDENCE"));
        assert!(text.contains("[planner]\n- {'guess_rate': 30}"));
    }
}
