//! Local Ollama backend (`/api/generate`, non-streaming).

use super::openai::classify;
use super::{CapabilityError, GenerationParams, Prompt, TextGenerator};
use crate::config::GenerationConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

impl OllamaBackend {
    pub fn from_config(config: &GenerationConfig) -> Result<Self, CapabilityError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CapabilityError::unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.timeout(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

#[async_trait]
impl TextGenerator for OllamaBackend {
    async fn generate_text(
        &self,
        prompt: &Prompt,
        params: GenerationParams,
    ) -> Result<String, CapabilityError> {
        let request = OllamaRequest {
            model: &self.model,
            system: &prompt.system,
            prompt: &prompt.user,
            stream: false,
            options: OllamaOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::unavailable(format!(
                "Ollama error ({status}): {body}"
            )));
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::unavailable(format!("Failed to parse Ollama response: {e}")))?;

        if !parsed.done {
            tracing::warn!(model = %self.model, "ollama_response_incomplete");
        }
        if parsed.response.trim().is_empty() {
            return Err(CapabilityError::unavailable("Ollama returned an empty response"));
        }
        Ok(parsed.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
