// llm-service-rs/src/llm_client.rs
//
// HTTP Client for interacting with LLM providers (OpenAI-compatible API)
//
// This module provides:
// - Real HTTP calls to LLM API providers via reqwest
// - Exponential backoff retry mechanism for resilient operation
// - Classification of retryable vs. non-retryable errors
//
// Settings come from `config_rs::LlmSettings`; the API key only from
// the LLM_API_KEY environment variable.

use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use config_rs::LlmSettings;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::TextOracle;

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

/// Errors from the LLM client, split by whether a retry can help.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    // Non-retryable: need intervention
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Model not available: {0}")]
    ModelNotAvailable(String),
    #[error("Client not configured: {0}")]
    NotConfigured(String),

    // Retryable with exponential backoff
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("Server error: {0}")]
    ServerError(String),
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Unknown error: {0}")]
    UnknownError(String),
}

impl LlmError {
    /// Server, network and rate-limit errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ServerError(_) | LlmError::NetworkError(_) | LlmError::RateLimitExceeded(_)
        )
    }

    fn from_status(status: u16, text: String) -> Self {
        match status {
            400 => LlmError::InvalidRequest(format!("Bad request: {}", text)),
            401 => LlmError::InvalidRequest(format!("Unauthorized: {}", text)),
            403 => LlmError::InvalidRequest(format!("Forbidden: {}", text)),
            404 => LlmError::ModelNotAvailable(format!("Not found: {}", text)),
            429 => LlmError::RateLimitExceeded(text),
            500..=599 => LlmError::ServerError(format!("({}): {}", status, text)),
            _ => LlmError::UnknownError(format!("({}): {}", status, text)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
    max_retries: u32,
    initial_retry_delay_ms: u64,
    max_retry_delay_ms: u64,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    /// Creates a client from loaded settings. Fails when no API key is set.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::NotConfigured("LLM_API_KEY is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::NotConfigured(format!("HTTP client: {}", e)))?;

        info!(api_url = %settings.api_url, model = %settings.model, "LLM client initialized");

        Ok(Self {
            client,
            api_key,
            api_url: settings.api_url.clone(),
            model: settings.model.clone(),
            max_retries: settings.max_retries,
            initial_retry_delay_ms: settings.initial_retry_delay_ms,
            max_retry_delay_ms: settings.max_retry_delay_ms,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Creates an exponential backoff policy with jitter
    ///
    /// Delay starts at `initial_retry_delay_ms`, doubles per attempt, is capped
    /// at `max_retry_delay_ms`, and the whole retry window at 2 minutes.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_retry_delay_ms))
            .with_max_interval(Duration::from_millis(self.max_retry_delay_ms))
            .with_multiplier(2.0)
            .with_max_elapsed_time(Some(Duration::from_secs(120)))
            .with_randomization_factor(0.5)
            .build()
    }

    /// Generate text from the LLM, retrying transient failures.
    ///
    /// # Arguments
    /// * `prompt` - The user's text prompt
    /// * `system_prompt` - Optional system instructions for the LLM
    pub async fn generate_text(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LlmError> {
        let mut backoff = self.create_backoff();
        let mut attempt = 0;

        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request_body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        };

        debug!(api_url = %self.api_url, model = %self.model, "preparing LLM request");

        loop {
            attempt += 1;
            if attempt > 1 {
                info!(attempt, "retrying LLM request");
            }

            match self.execute_request(&request_body).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !err.is_retryable() || attempt > self.max_retries {
                        error!(attempt, error = %err, "LLM request failed");
                        return Err(err);
                    }

                    match backoff.next_backoff() {
                        Some(delay) => {
                            // Extra jitter so concurrent requests do not retry in lockstep.
                            let jitter = rand::thread_rng().gen_range(0..=200);
                            let delay = delay + Duration::from_millis(jitter);
                            warn!(error = %err, ?delay, "retryable LLM error");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!(error = %err, "exceeded maximum backoff time");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    // Execute a single request attempt
    async fn execute_request(&self, request_body: &ChatCompletionRequest) -> Result<String, LlmError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(request_body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::NetworkError(format!("Request timed out: {}", err))
                } else if err.is_connect() {
                    LlmError::NetworkError(format!("Connection failed: {}", err))
                } else {
                    LlmError::NetworkError(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), text));
        }

        let data: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse response: {}", e)))?;

        if let Some(usage) = &data.usage {
            debug!(total_tokens = usage.total_tokens, "LLM request completed");
        }

        data.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ParseError("No choices returned in response".to_string()))
    }
}

#[async_trait]
impl TextOracle for LlmClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        self.generate_text(prompt, Some(system)).await
    }
}
