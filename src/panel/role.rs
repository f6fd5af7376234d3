//! The five panel roles and what each one produced.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::ExperimentParams;

/// Longest free-text answer accepted from the coder or critic.
pub const MAX_ADVISORY_CHARS: usize = 4000;

/// Closed set of reasoning roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Coder,
    Critic,
    Verifier,
    Summarizer,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Planner, Role::Coder, Role::Critic, Role::Verifier, Role::Summarizer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Coder => "coder",
            Role::Critic => "critic",
            Role::Verifier => "verifier",
            Role::Summarizer => "summarizer",
        }
    }

    /// Role-specific system instruction sent to the reasoning backend.
    pub fn instruction(&self) -> &'static str {
        match self {
            Role::Planner => {
                "You are the planner. Propose the next hardware experiment from the UART evidence. \
                 Only the runner touches hardware. Use only the parameter names and values the case allows. \
                 Emit each proposal as a one-line dict bullet, e.g. - {'guess_rate': 42}"
            }
            Role::Coder => {
                "You are the coder. Suggest minimal firmware instrumentation changes that would make the \
                 evidence clearer. Advisory only; nothing you write is applied automatically."
            }
            Role::Critic => {
                "You are the critic. Review the planner's proposal for feasibility and risk: invalid keys, \
                 out-of-range values, repeating an experiment that already failed."
            }
            Role::Verifier => {
                "You are the verifier. Judge the quality of the evidence itself. Start your answer with \
                 confidence=<number between 0 and 1>, then list blockers."
            }
            Role::Summarizer => {
                "You are the summarizer. Merge the planner, coder, critic and verifier outputs into one \
                 recommendation. Emit exactly one dict bullet with the next parameters, e.g. - {'guess_rate': 42}. \
                 If the coder and critic must revisit their answers first, add a line REWORK: <reason>."
            }
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a role output came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputSource {
    Backend,
    Fallback { reason: String },
}

/// One role's contribution to a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleOutput {
    pub role: Role,
    pub text: String,
    /// Parsed and validated parameters (planner and summarizer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ExperimentParams>,
    /// Evidence confidence (verifier)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Risks raised against the proposal (critic)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    pub source: OutputSource,
}

impl RoleOutput {
    pub fn backend(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            proposal: None,
            confidence: None,
            flags: Vec::new(),
            source: OutputSource::Backend,
        }
    }

    pub fn fallback(role: Role, text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            proposal: None,
            confidence: None,
            flags: Vec::new(),
            source: OutputSource::Fallback { reason: reason.into() },
        }
    }

    pub fn with_proposal(mut self, proposal: ExperimentParams) -> Self {
        self.proposal = Some(proposal);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.source, OutputSource::Fallback { .. })
    }

    /// The `REWORK:` request in a summarizer answer, if any.
    pub fn rework_request(&self) -> Option<&str> {
        if self.is_fallback() {
            return None;
        }
        self.text
            .lines()
            .filter_map(|l| l.trim().strip_prefix("REWORK:"))
            .map(str::trim)
            .find(|reason| !reason.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names() {
        let names: Vec<&str> = Role::ALL.iter().map(|r| r.as_str()).collect();
        assert_eq!(names, vec!["planner", "coder", "critic", "verifier", "summarizer"]);
        assert_eq!(serde_json::to_string(&Role::Verifier).unwrap(), "\"verifier\"");
    }

    #[test]
    fn test_instructions_are_role_specific() {
        assert!(Role::Planner.instruction().contains("dict bullet"));
        assert!(Role::Verifier.instruction().contains("confidence="));
        assert!(Role::Summarizer.instruction().contains("REWORK:"));
    }

    #[test]
    fn test_rework_request() {
        let out = RoleOutput::backend(Role::Summarizer, "- {'guess_rate': 40}\nREWORK: critic ignored bounds");
        assert_eq!(out.rework_request(), Some("critic ignored bounds"));

        let plain = RoleOutput::backend(Role::Summarizer, "- {'guess_rate': 40}");
        assert_eq!(plain.rework_request(), None);

        let fallback = RoleOutput::fallback(Role::Summarizer, "REWORK: never", "timeout");
        assert_eq!(fallback.rework_request(), None);
    }

    #[test]
    fn test_source_serialization() {
        let out = RoleOutput::fallback(Role::Coder, "hint", "backend unreachable");
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["source"]["kind"], "fallback");
        assert_eq!(json["source"]["reason"], "backend unreachable");
        assert!(json.get("proposal").is_none());
    }
}
