//! LLM completion provider.
//!
//! [`OpenRouterClient`] talks to any OpenAI-compatible `/chat/completions`
//! endpoint and owns the bounded retry for transient failures; the pipeline
//! itself never retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use oncall_retrieval::QueryExpander;
use oncall_shared::{LlmConfig, OncallError, Result, resolve_api_key};

/// A text completion collaborator.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

pub struct OpenRouterClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl OpenRouterClient {
    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| OncallError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Build a client reading the API key from the configured env var.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = resolve_api_key(&config.api_key_env)?;
        Self::new(config, api_key)
    }

    async fn send_once(&self, body: &ChatRequest<'_>) -> std::result::Result<String, Failure> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Failure::retryable(format!("request timed out after {}s", self.timeout.as_secs()))
                } else {
                    Failure::retryable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|r| r.error.message)
                .unwrap_or(body);
            let message = format!("HTTP {}: {message}", status.as_u16());
            return Err(if is_retryable(status) {
                Failure::retryable(message)
            } else {
                Failure::fatal(message)
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Failure::fatal(format!("malformed completion response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Failure::fatal("completion returned no content".into()))
    }
}

#[async_trait]
impl LlmProvider for OpenRouterClient {
    #[instrument(skip_all, fields(model = %self.model, prompt_len = prompt.len()))]
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(text) => {
                    debug!(attempt, len = text.len(), "completion received");
                    return Ok(text);
                }
                Err(failure) if failure.retryable && attempt < self.max_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %failure.message, "LLM call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    return Err(OncallError::LlmProvider(format!(
                        "{} (after {} attempt(s))",
                        failure.message,
                        attempt + 1
                    )));
                }
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

struct Failure {
    message: String,
    retryable: bool,
}

impl Failure {
    fn retryable(message: String) -> Self {
        Self {
            message,
            retryable: true,
        }
    }

    fn fatal(message: String) -> Self {
        Self {
            message,
            retryable: false,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

// ---------------------------------------------------------------------------
// Structured output
// ---------------------------------------------------------------------------

/// Parse the first JSON value in an LLM reply.
///
/// Tolerates Markdown code fences and prose around the JSON.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let start = text
        .find(['{', '['])
        .ok_or_else(|| OncallError::LlmProvider("response contains no JSON".into()))?;

    let value = serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<serde_json::Value>()
        .next()
        .ok_or_else(|| OncallError::LlmProvider("response contains no JSON".into()))?
        .map_err(|e| OncallError::LlmProvider(format!("malformed JSON in response: {e}")))?;

    serde_json::from_value(value)
        .map_err(|e| OncallError::LlmProvider(format!("unexpected JSON shape: {e}")))
}

// ---------------------------------------------------------------------------
// Query expansion
// ---------------------------------------------------------------------------

const EXPANSION_SYSTEM: &str = "You rewrite incident search queries. \
Reply with a JSON array of strings and nothing else.";

/// Alternative phrasings for multi-query retrieval, from the LLM.
pub struct LlmQueryExpander {
    llm: Arc<dyn LlmProvider>,
}

impl LlmQueryExpander {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl QueryExpander for LlmQueryExpander {
    async fn expand(&self, query: &str, variants: usize) -> Result<Vec<String>> {
        if variants == 0 {
            return Ok(Vec::new());
        }
        let prompt = format!(
            "Write {variants} different phrasings of this search query for finding \
             similar past incidents in postmortem documents.\n\nQuery: {query}"
        );
        let reply = self.llm.complete(EXPANSION_SYSTEM, &prompt).await?;
        let phrasings: Vec<String> = parse_json(&reply)?;
        Ok(phrasings
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && p != query)
            .take(variants)
            .collect())
    }
}
