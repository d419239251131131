//! # Text Generation
//!
//! The untrusted half of the pipeline. Any backend that can turn a prompt
//! into text implements [`TextGenerator`]; [`QueryGenerator`] wraps one with
//! a wall-clock timeout and turns its raw output into a
//! [`GenerationAttempt`] the guard can inspect.
//!
//! Failures are classified, never retried here: a capability that cannot be
//! reached is `Unavailable`, one that does not answer in time is `Timeout`.

mod ollama;
mod openai;

pub use ollama::OllamaBackend;
pub use openai::OpenAiCompatibleBackend;

use crate::config::{BackendKind, GenerationConfig};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Classified generation capability failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityError {
    /// Backend unreachable, refused the request, or answered with garbage
    #[error("Generation capability unavailable: {detail}")]
    Unavailable { detail: String },

    /// Backend did not answer within the configured timeout
    #[error("Generation capability timed out after {after:?}")]
    Timeout { after: Duration },
}

impl CapabilityError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        CapabilityError::Unavailable {
            detail: detail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CapabilityError::Timeout { .. })
    }
}

/// A chat-style prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Sampling parameters for one call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationParams {
            max_tokens: 512,
            temperature: 0.0,
        }
    }
}

/// The external text generation capability
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce text for `prompt`
    async fn generate_text(
        &self,
        prompt: &Prompt,
        params: GenerationParams,
    ) -> Result<String, CapabilityError>;

    /// Backend label for diagnostics
    fn name(&self) -> &str {
        "generator"
    }
}

/// Build the configured backend
pub fn backend_from_config(
    config: &GenerationConfig,
) -> Result<Arc<dyn TextGenerator>, CapabilityError> {
    Ok(match config.backend {
        BackendKind::Openai => Arc::new(OpenAiCompatibleBackend::from_config(config)?),
        BackendKind::Ollama => Arc::new(OllamaBackend::from_config(config)?),
    })
}

/// Run one generation call under a wall-clock timeout.
///
/// Dropping the in-flight future cancels the underlying request.
pub async fn generate_with_timeout(
    backend: &dyn TextGenerator,
    prompt: &Prompt,
    params: GenerationParams,
    timeout: Duration,
) -> Result<String, CapabilityError> {
    match tokio::time::timeout(timeout, backend.generate_text(prompt, params)).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout { after: timeout }),
    }
}

/// One generation call's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    /// 1-based
    pub attempt_index: usize,
    pub candidate_query_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_rationale: Option<String>,
}

/// Produces candidate queries from prompts
pub struct QueryGenerator {
    backend: Arc<dyn TextGenerator>,
    params: GenerationParams,
    timeout: Duration,
}

impl QueryGenerator {
    pub fn new(backend: Arc<dyn TextGenerator>, params: GenerationParams, timeout: Duration) -> Self {
        QueryGenerator {
            backend,
            params,
            timeout,
        }
    }

    pub fn from_config(backend: Arc<dyn TextGenerator>, config: &GenerationConfig) -> Self {
        QueryGenerator::new(
            backend,
            GenerationParams {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
            },
            config.timeout(),
        )
    }

    /// Ask the backend for a candidate query.
    ///
    /// Capability failures are returned as-is; retry policy belongs to the caller.
    pub async fn generate(
        &self,
        prompt: &Prompt,
        attempt_index: usize,
    ) -> Result<GenerationAttempt, CapabilityError> {
        let raw = generate_with_timeout(self.backend.as_ref(), prompt, self.params, self.timeout)
            .await?;
        let (candidate, rationale) = split_generation(&raw);
        tracing::debug!(
            backend = self.backend.name(),
            attempt = attempt_index,
            candidate = %candidate,
            "candidate_generated"
        );
        Ok(GenerationAttempt {
            attempt_index,
            candidate_query_text: candidate,
            generator_rationale: rationale,
        })
    }
}

fn fenced_block() -> &'static Regex {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    FENCED.get_or_init(|| {
        Regex::new(r"(?is)```[ \t]*(?:sql|sqlite)?[ \t]*\r?\n?(.*?)```").expect("static regex")
    })
}

fn stray_fence() -> &'static Regex {
    static STRAY: OnceLock<Regex> = OnceLock::new();
    STRAY.get_or_init(|| {
        Regex::new(r"(?i)^\s*```(?:sql|sqlite)?\s*|\s*```\s*$").expect("static regex")
    })
}

/// Split raw backend output into (query text, optional rationale).
///
/// A fenced block wins; prose around it becomes the rationale.
pub fn split_generation(raw: &str) -> (String, Option<String>) {
    if let Some(captures) = fenced_block().captures(raw) {
        let query = captures.get(1).map_or("", |m| m.as_str()).trim().to_string();
        let whole = captures.get(0).map_or(0..0, |m| m.range());
        let outside = format!("{} {}", &raw[..whole.start], &raw[whole.end..]);
        let rationale = outside.split_whitespace().collect::<Vec<_>>().join(" ");
        let rationale = (!rationale.is_empty()).then_some(rationale);
        return (query, rationale);
    }
    (stray_fence().replace_all(raw, "").trim().to_string(), None)
}
