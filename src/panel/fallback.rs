//! Deterministic per-role fallbacks.
//!
//! Each function depends only on the case, the failed attempt's parameters
//! and its analysis, so a panel with no backend still converges.

use super::prompt::{PanelContext, proposal_bullet};
use crate::analysis::AnalysisResult;
use crate::domain::{CODE_TOO_LOW, CaseSpec, ExperimentParams, SearchSpace};

/// Planner fallback: narrow the search space from the last result.
///
/// - range: binary narrowing on `<key>_lo`/`<key>_hi`; `TOO_LOW` raises the
///   lower bound, anything else lowers the upper bound. Bounds that cross
///   reset to the full range.
/// - choice: the next option after the current one, wrapping around.
/// - signature: adopt a reported magic whose CRC is self-consistent.
pub fn plan(case: &CaseSpec, current: &ExperimentParams, analysis: &AnalysisResult) -> ExperimentParams {
    match &case.search {
        SearchSpace::Range { key, min, max } => {
            let lo_key = case.search.lo_key();
            let hi_key = case.search.hi_key();
            let mut lo = current.get_int(&lo_key).unwrap_or(*min).clamp(*min, *max);
            let mut hi = current.get_int(&hi_key).unwrap_or(*max).clamp(*min, *max);
            let guess = current.get_int(key).unwrap_or(lo + (hi - lo) / 2);

            match analysis.last_error_code.as_deref() {
                Some(CODE_TOO_LOW) => lo = guess.saturating_add(1),
                // TOO_HIGH, timeouts and unknown failures all push the guess down
                _ => hi = guess.saturating_sub(1),
            }
            if lo > hi || lo < *min || hi > *max {
                lo = *min;
                hi = *max;
            }
            let next = lo + (hi - lo) / 2;
            current.with(key.clone(), next).with(lo_key, lo).with(hi_key, hi)
        }
        SearchSpace::Choice { key, options } => {
            if options.is_empty() {
                return current.clone();
            }
            let next = match current.get(key).and_then(|v| options.iter().position(|o| o == v)) {
                Some(i) => &options[(i + 1) % options.len()],
                None => &options[0],
            };
            current.with(key.clone(), next.clone())
        }
        SearchSpace::Signature { key, .. } => {
            let adopted = analysis
                .signature
                .as_ref()
                .filter(|s| s.self_consistent)
                .and_then(|s| s.reported_magic);
            match adopted {
                Some(magic) => current.with(key.clone(), magic as i64),
                None => current.clone(),
            }
        }
    }
}

pub fn planner_text(case: &CaseSpec, proposal: &ExperimentParams, analysis: &AnalysisResult) -> String {
    let cause = analysis.last_error_code.as_deref().unwrap_or("no error code");
    format!(
        "Deterministic narrowing of {} after {}.\n{}",
        case.search.describe(),
        cause,
        proposal_bullet(proposal)
    )
}

/// Coder fallback: instrumentation hints keyed off what the evidence lacks.
pub fn coder_hints(analysis: &AnalysisResult) -> String {
    let mut hints = Vec::new();
    if analysis.missing_start {
        hints.push("Print RUN_START <run_id> before any other output after boot.");
    }
    if analysis.missing_end {
        hints.push("Print RUN_END <run_id> on every exit path, including error paths.");
    }
    if analysis.error_count > 0 {
        hints.push("Keep ERROR lines as ERROR <code> <message> with a stable code token.");
    }
    if analysis.max_gap_ms > 1000 {
        hints.push("Add periodic INFO heartbeats so long gaps are visible.");
    }
    if hints.is_empty() {
        hints.push("Instrumentation looks sufficient; no change suggested.");
    }
    hints.iter().map(|h| format!("- {}", h)).collect::<Vec<_>>().join("\n")
}

/// Critic fallback: risks in a proposal relative to the failed parameters.
pub fn critique(case: &CaseSpec, current: &ExperimentParams, proposal: &ExperimentParams) -> Vec<String> {
    let mut flags = Vec::new();
    if let Err(e) = case.validate(proposal) {
        flags.push(format!("invalid proposal: {}", e));
    }
    let key = case.search.key();
    if proposal.get(key).is_some() && proposal.get(key) == current.get(key) {
        flags.push(format!("repeats failed {}={}", key, current.get(key).map(|v| v.to_string()).unwrap_or_default()));
    }
    flags
}

pub fn critic_text(flags: &[String]) -> String {
    if flags.is_empty() {
        "No feasibility risks found in the proposal.".to_string()
    } else {
        flags.iter().map(|f| format!("- RISK: {}", f)).collect::<Vec<_>>().join("\n")
    }
}

/// Verifier fallback: confidence in the evidence itself.
pub fn confidence(analysis: &AnalysisResult) -> f64 {
    let mut score: f64 = 1.0;
    if analysis.missing_start {
        score -= 0.3;
    }
    if analysis.missing_end {
        score -= 0.3;
    }
    if analysis.timed_out {
        score -= 0.2;
    }
    if analysis.line_count < 3 {
        score -= 0.2;
    }
    (score.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

pub fn verifier_text(analysis: &AnalysisResult) -> String {
    let mut blockers = Vec::new();
    if analysis.missing_start {
        blockers.push("no run start for this run");
    }
    if analysis.missing_end {
        blockers.push("no run end for this run");
    }
    if analysis.timed_out {
        blockers.push("capture hit its deadline");
    }
    let blockers = if blockers.is_empty() {
        "none".to_string()
    } else {
        blockers.join(", ")
    };
    format!("confidence={:.2}\nblockers: {}", confidence(analysis), blockers)
}

/// Summarizer fallback: take the planner's proposal when it is usable,
/// otherwise the deterministic plan.
pub fn summarize(ctx: &PanelContext<'_>, planner_proposal: Option<&ExperimentParams>) -> (ExperimentParams, String) {
    if let Some(p) = planner_proposal {
        let flags = critique(ctx.case, ctx.current, p);
        if flags.is_empty() {
            let text = format!("Adopting planner proposal.\n{}", proposal_bullet(p));
            return (p.clone(), text);
        }
    }
    let next = plan(ctx.case, ctx.current, ctx.analysis);
    let text = format!("Using deterministic narrowing.\n{}", proposal_bullet(&next));
    (next, text)
}
