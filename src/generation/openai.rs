//! OpenAI-compatible chat completions backend.
//!
//! Works against hosted routers (the default points at the Hugging Face
//! router) as well as local vLLM or llama.cpp servers. The bearer token is
//! optional so unauthenticated local servers work too.

use super::{CapabilityError, GenerationParams, Prompt, TextGenerator};
use crate::config::GenerationConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct OpenAiCompatibleBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl OpenAiCompatibleBackend {
    pub fn from_config(config: &GenerationConfig) -> Result<Self, CapabilityError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CapabilityError::unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.resolved_api_key(),
            timeout: config.timeout(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleBackend {
    async fn generate_text(
        &self,
        prompt: &Prompt,
        params: GenerationParams,
    ) -> Result<String, CapabilityError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: false,
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(parsed) => parsed.error.message,
                Err(_) => body,
            };
            return Err(CapabilityError::unavailable(format!(
                "API error ({status}): {detail}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::unavailable(format!("Failed to parse response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| CapabilityError::unavailable("Response contained no completion text"))
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

pub(super) fn classify(e: &reqwest::Error, timeout: Duration) -> CapabilityError {
    if e.is_timeout() {
        CapabilityError::Timeout { after: timeout }
    } else if e.is_connect() {
        CapabilityError::unavailable(format!("Connection failed: {e}"))
    } else {
        CapabilityError::unavailable(format!("Request failed: {e}"))
    }
}
