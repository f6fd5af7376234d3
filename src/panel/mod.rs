//! Decision panel - five reasoning roles that propose the next experiment
//!
//! Every role call carries its own deadline, capped by what is left of the
//! panel budget. A call that errors, times out or returns text of the wrong
//! shape is replaced by that role's deterministic fallback, so the panel
//! always produces a schema-valid parameter set and never stalls the loop.

pub mod backend;
pub mod fallback;
pub mod prompt;
pub mod role;

pub use backend::{ChatCompletionsBackend, DisabledBackend, ReasoningBackend, ReasoningError};
pub use prompt::{PanelContext, evidence_prompt, proposal_bullet};
pub use role::{MAX_ADVISORY_CHARS, OutputSource, Role, RoleOutput};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ExecutionMode, PanelConfig};
use crate::domain::{ExperimentParams, parse_proposals};
use prompt::{rework_input, role_input};

/// The panel's merged recommendation for one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub next_params: ExperimentParams,
    /// Final output of each role, planner first and summarizer last
    pub roles: Vec<RoleOutput>,
    pub mode: ExecutionMode,
    pub rework_rounds: u32,
    pub elapsed_ms: u64,
}

impl DecisionOutput {
    pub fn role(&self, role: Role) -> Option<&RoleOutput> {
        self.roles.iter().find(|r| r.role == role)
    }

    pub fn rationale(&self, role: Role) -> Option<&str> {
        self.role(role).map(|r| r.text.as_str())
    }

    pub fn fallback_count(&self) -> usize {
        self.roles.iter().filter(|r| r.is_fallback()).count()
    }
}

/// Find a `confidence` value in [0, 1] in verifier text.
pub fn parse_confidence(text: &str) -> Option<f64> {
    let lower = text.to_ascii_lowercase();
    lower.match_indices("confidence").find_map(|(i, word)| {
        let rest = lower[i + word.len()..].trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '=' | ':' | '*'));
        let number: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
        number.parse::<f64>().ok().filter(|v| (0.0..=1.0).contains(v))
    })
}

/// Check a backend reply against the shape its role must have.
pub fn validate_shape(role: Role, text: &str, ctx: &PanelContext<'_>) -> Result<RoleOutput, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty response".to_string());
    }
    match role {
        Role::Planner | Role::Summarizer => {
            let proposals = parse_proposals(text);
            if proposals.is_empty() {
                return Err("no parameter proposal bullet".to_string());
            }
            let mut last_err = String::new();
            for p in proposals {
                let candidate = ctx.current.merged(&p);
                match ctx.case.validate(&candidate) {
                    Ok(()) => return Ok(RoleOutput::backend(role, text).with_proposal(candidate)),
                    Err(e) => last_err = e,
                }
            }
            Err(format!("no proposal passed validation: {}", last_err))
        }
        Role::Verifier => parse_confidence(text)
            .map(|c| RoleOutput::backend(role, text).with_confidence(c))
            .ok_or_else(|| "no confidence value in [0, 1]".to_string()),
        Role::Coder | Role::Critic => {
            if text.chars().count() >= MAX_ADVISORY_CHARS {
                Err(format!("response longer than {} characters", MAX_ADVISORY_CHARS))
            } else {
                Ok(RoleOutput::backend(role, text))
            }
        }
    }
}

/// Deterministic stand-in for `role`.
pub fn fallback_output(role: Role, ctx: &PanelContext<'_>, planner: Option<&RoleOutput>, reason: &str) -> RoleOutput {
    match role {
        Role::Planner => {
            let next = fallback::plan(ctx.case, ctx.current, ctx.analysis);
            RoleOutput::fallback(role, fallback::planner_text(ctx.case, &next, ctx.analysis), reason).with_proposal(next)
        }
        Role::Coder => RoleOutput::fallback(role, fallback::coder_hints(ctx.analysis), reason),
        Role::Critic => {
            let proposal = planner
                .and_then(|p| p.proposal.clone())
                .unwrap_or_else(|| fallback::plan(ctx.case, ctx.current, ctx.analysis));
            let flags = fallback::critique(ctx.case, ctx.current, &proposal);
            RoleOutput::fallback(role, fallback::critic_text(&flags), reason).with_flags(flags)
        }
        Role::Verifier => RoleOutput::fallback(role, fallback::verifier_text(ctx.analysis), reason)
            .with_confidence(fallback::confidence(ctx.analysis)),
        Role::Summarizer => {
            let (next, text) = fallback::summarize(ctx, planner.and_then(|p| p.proposal.as_ref()));
            RoleOutput::fallback(role, text, reason).with_proposal(next)
        }
    }
}

pub struct DecisionPanel {
    backend: Arc<dyn ReasoningBackend>,
    mode: ExecutionMode,
    role_timeout: Duration,
    budget: Duration,
    rework_rounds: u32,
}

impl DecisionPanel {
    pub fn new(backend: Arc<dyn ReasoningBackend>, config: &PanelConfig) -> Self {
        Self {
            backend,
            mode: config.execution_mode,
            role_timeout: Duration::from_millis(config.role_timeout_ms),
            budget: Duration::from_millis(config.panel_budget_ms),
            rework_rounds: config.rework_rounds,
        }
    }

    /// Panel over the configured chat endpoint, or fallbacks only when disabled.
    pub fn from_config(config: &PanelConfig) -> Self {
        let backend: Arc<dyn ReasoningBackend> = if !config.enabled {
            info!("Decision panel disabled; using deterministic fallbacks");
            Arc::new(DisabledBackend)
        } else {
            match ChatCompletionsBackend::from_config(config) {
                Ok(b) => Arc::new(b),
                Err(e) => {
                    warn!(error = %e, "Reasoning backend unavailable; using deterministic fallbacks");
                    Arc::new(DisabledBackend)
                }
            }
        };
        Self::new(backend, config)
    }

    async fn consult(&self, role: Role, input: &str, ctx: &PanelContext<'_>, deadline: Instant) -> Result<RoleOutput, String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err("panel budget exhausted".to_string());
        }
        let limit = self.role_timeout.min(remaining);
        let text = match tokio::time::timeout(limit, self.backend.complete(role, role.instruction(), input)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("timed out after {}ms", limit.as_millis())),
        };
        validate_shape(role, &text, ctx)
    }

    fn resolve(
        &self,
        role: Role,
        result: Result<RoleOutput, String>,
        ctx: &PanelContext<'_>,
        planner: Option<&RoleOutput>,
    ) -> RoleOutput {
        match result {
            Ok(out) => {
                debug!(role = %role, "Role answered");
                out
            }
            Err(reason) => {
                warn!(role = %role, reason = %reason, "Role replaced by fallback");
                fallback_output(role, ctx, planner, &reason)
            }
        }
    }

    async fn run_role(
        &self,
        role: Role,
        input: String,
        ctx: &PanelContext<'_>,
        planner: Option<&RoleOutput>,
        deadline: Instant,
    ) -> RoleOutput {
        let result = self.consult(role, &input, ctx, deadline).await;
        self.resolve(role, result, ctx, planner)
    }

    /// Produce the next experiment for a failed attempt.
    pub async fn decide(&self, ctx: &PanelContext<'_>) -> DecisionOutput {
        let started = Instant::now();
        let deadline = started + self.budget;
        let evidence = evidence_prompt(ctx);

        let (roles, rework_rounds) = match self.mode {
            ExecutionMode::Sequential => self.run_sequential(&evidence, ctx, deadline).await,
            ExecutionMode::FanOut => (self.run_fan_out(&evidence, ctx, deadline).await, 0),
        };

        let next_params = roles
            .iter()
            .find(|r| r.role == Role::Summarizer)
            .and_then(|r| r.proposal.clone())
            .filter(|p| ctx.case.validate(p).is_ok())
            .unwrap_or_else(|| fallback::plan(ctx.case, ctx.current, ctx.analysis));

        let decision = DecisionOutput {
            next_params,
            roles,
            mode: self.mode,
            rework_rounds,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            next = %decision.next_params,
            fallbacks = decision.fallback_count(),
            mode = %decision.mode,
            "Panel decided"
        );
        decision
    }

    async fn run_sequential(&self, evidence: &str, ctx: &PanelContext<'_>, deadline: Instant) -> (Vec<RoleOutput>, u32) {
        let planner = self
            .run_role(Role::Planner, role_input(evidence, &[]), ctx, None, deadline)
            .await;
        let mut coder = self
            .run_role(Role::Coder, role_input(evidence, &[&planner]), ctx, Some(&planner), deadline)
            .await;
        let mut critic = self
            .run_role(Role::Critic, role_input(evidence, &[&planner, &coder]), ctx, Some(&planner), deadline)
            .await;
        let verifier = self
            .run_role(
                Role::Verifier,
                role_input(evidence, &[&planner, &coder, &critic]),
                ctx,
                Some(&planner),
                deadline,
            )
            .await;
        let mut summary = self
            .run_role(
                Role::Summarizer,
                role_input(evidence, &[&planner, &coder, &critic, &verifier]),
                ctx,
                Some(&planner),
                deadline,
            )
            .await;

        let mut rounds = 0;
        while rounds < self.rework_rounds {
            let Some(reason) = summary.rework_request().map(String::from) else {
                break;
            };
            rounds += 1;
            info!(round = rounds, reason = %reason, "Summarizer requested rework");
            coder = self
                .run_role(Role::Coder, rework_input(evidence, &summary, &reason, rounds), ctx, Some(&planner), deadline)
                .await;
            let critic_input = format!("{}\n[coder]\n{}\n", rework_input(evidence, &summary, &reason, rounds), coder.text);
            critic = self
                .run_role(Role::Critic, critic_input, ctx, Some(&planner), deadline)
                .await;
            summary = self
                .run_role(
                    Role::Summarizer,
                    role_input(evidence, &[&planner, &coder, &critic, &verifier]),
                    ctx,
                    Some(&planner),
                    deadline,
                )
                .await;
        }

        (vec![planner, coder, critic, verifier, summary], rounds)
    }

    async fn run_fan_out(&self, evidence: &str, ctx: &PanelContext<'_>, deadline: Instant) -> Vec<RoleOutput> {
        let input = role_input(evidence, &[]);
        let (planner, coder, critic, verifier) = tokio::join!(
            self.consult(Role::Planner, &input, ctx, deadline),
            self.consult(Role::Coder, &input, ctx, deadline),
            self.consult(Role::Critic, &input, ctx, deadline),
            self.consult(Role::Verifier, &input, ctx, deadline),
        );
        let planner = self.resolve(Role::Planner, planner, ctx, None);
        let coder = self.resolve(Role::Coder, coder, ctx, Some(&planner));
        let critic = self.resolve(Role::Critic, critic, ctx, Some(&planner));
        let verifier = self.resolve(Role::Verifier, verifier, ctx, Some(&planner));

        let summary = self
            .run_role(
                Role::Summarizer,
                role_input(evidence, &[&planner, &coder, &critic, &verifier]),
                ctx,
                Some(&planner),
                deadline,
            )
            .await;
        vec![planner, coder, critic, verifier, summary]
    }
}
