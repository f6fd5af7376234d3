//! Reasoning backend boundary: one request/response call per role invocation.
//!
//! Replies are untrusted text. Nothing here validates them; the panel does.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

use super::role::Role;
use crate::config::PanelConfig;
use crate::error::HilError;

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning backend disabled")]
    Disabled,

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<ReasoningError> for HilError {
    fn from(err: ReasoningError) -> Self {
        HilError::ReasoningUnavailable(err.to_string())
    }
}

/// A stateless text-completion service.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, role: Role, instruction: &str, input: &str) -> Result<String, ReasoningError>;
}

/// Backend used when the panel is disabled; every role falls back.
#[derive(Debug, Clone, Default)]
pub struct DisabledBackend;

#[async_trait]
impl ReasoningBackend for DisabledBackend {
    async fn complete(&self, _role: Role, _instruction: &str, _input: &str) -> Result<String, ReasoningError> {
        Err(ReasoningError::Disabled)
    }
}

/// OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct ChatCompletionsBackend {
    client: Client,
    url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatCompletionsBackend {
    pub fn from_config(config: &PanelConfig) -> Result<Self, ReasoningError> {
        // Per-call deadlines are enforced by the panel; this only caps stuck sockets.
        let client = Client::builder()
            .timeout(Duration::from_millis(config.panel_budget_ms.max(config.role_timeout_ms)))
            .build()
            .map_err(|e| ReasoningError::Unreachable(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.chat_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    pub fn build_request(&self, instruction: &str, input: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": instruction},
                {"role": "user", "content": input},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

/// Pull the first choice's message text out of a chat-completions reply.
pub fn parse_chat_response(body: &Value) -> Result<String, ReasoningError> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ReasoningError::Malformed("missing choices[0].message.content".to_string()))?
        .trim();
    if text.is_empty() {
        return Err(ReasoningError::Malformed("empty content".to_string()));
    }
    Ok(text.to_string())
}

#[async_trait]
impl ReasoningBackend for ChatCompletionsBackend {
    async fn complete(&self, role: Role, instruction: &str, input: &str) -> Result<String, ReasoningError> {
        tracing::debug!(role = %role, url = %self.url, "Calling reasoning backend");
        let response = self
            .client
            .post(&self.url)
            .json(&self.build_request(instruction, input))
            .send()
            .await
            .map_err(|e| ReasoningError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        parse_chat_response(&body)
    }
}
