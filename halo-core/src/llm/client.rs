//! LLM client trait and HTTP provider implementations.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, Provider, StopReason, TokenUsage,
};

/// LLM client used by the LLM-backed judges.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Provider dialect of this client.
    fn provider(&self) -> Provider;
}

/// Configuration for LLM clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Retries on transport errors, 429 and 5xx responses
    pub max_retries: u32,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 30,
            max_retries: 2,
        }
    }

    /// Read the API key and optional overrides for `provider` from the
    /// environment.
    ///
    /// `HALO_LLM_BASE_URL` and `HALO_LLM_MODEL` override the endpoint and model.
    pub fn from_env(provider: Provider) -> Result<Self> {
        let var = provider.api_key_var();
        let api_key = std::env::var(var)
            .map_err(|_| Error::Config(format!("{} is not set", var)))?;

        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("HALO_LLM_BASE_URL") {
            config.base_url = Some(url);
        }
        if let Ok(model) = std::env::var("HALO_LLM_MODEL") {
            config.default_model = Some(model);
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Build a reqwest client with the given timeout.
pub(crate) fn build_http_client(timeout: Duration) -> std::result::Result<Client, reqwest::Error> {
    // Proxy auto-detection can panic in some sandboxed environments.
    // Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(_)) | Err(_) => Client::builder().no_proxy().timeout(timeout).build(),
    }
}

fn provider_http_client(provider: Provider, timeout_secs: u64) -> Result<Client> {
    build_http_client(Duration::from_secs(timeout_secs))
        .map_err(|e| Error::llm_api(provider.to_string(), format!("HTTP client: {}", e)))
}

/// Send a request, retrying transport errors and retryable statuses with
/// exponential backoff. Returns the body of the first successful response.
async fn send_with_retries<F>(provider: Provider, max_retries: u32, build: F) -> Result<String>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match build().send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.map_err(|e| {
                    Error::llm_api(provider.to_string(), format!("Failed to read response: {}", e))
                })?;
                if status.is_success() {
                    return Ok(body);
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                (api_error(provider, status, &body), retryable)
            }
            Err(e) => (
                Error::llm_api(provider.to_string(), format!("HTTP request failed: {}", e)),
                true,
            ),
        };

        let (error, retryable) = outcome;
        if !retryable || attempt >= max_retries {
            return Err(error);
        }
        attempt += 1;
        let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(6)));
        tracing::debug!(%provider, attempt, ?backoff, "retrying LLM request");
        tokio::time::sleep(backoff).await;
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn api_error(provider: Provider, status: reqwest::StatusCode, body: &str) -> Error {
    match serde_json::from_str::<ApiError>(body) {
        Ok(error) => Error::llm_api(provider.to_string(), format!("{}: {}", status, error.error.message)),
        Err(_) => Error::llm_api(provider.to_string(), format!("{}: {}", status, body)),
    }
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = provider_http_client(Provider::Anthropic, config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn role_name(role: ChatRole) -> String {
    match role {
        ChatRole::User => "user".to_string(),
        ChatRole::Assistant => "assistant".to_string(),
    }
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let provider = self.provider();
        let model = request
            .model
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| provider.default_model().to_string());

        let api_request = AnthropicRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: role_name(m.role),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: request.max_tokens.unwrap_or(1024),
            system: request.system,
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let body = send_with_retries(provider, self.config.max_retries, || {
            self.http
                .post(&url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", Self::API_VERSION)
                .header("content-type", "application/json")
                .json(&api_request)
        })
        .await?;

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api(provider.to_string(), format!("Failed to parse response: {}", e)))?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        });

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            },
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAIClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAIClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = provider_http_client(Provider::OpenAI, config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let provider = self.provider();
        let model = request
            .model
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| provider.default_model().to_string());

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: role_name(m.role),
            content: m.content.clone(),
        }));

        let api_request = OpenAIRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());
        let body = send_with_retries(provider, self.config.max_retries, || {
            self.http
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .header("content-type", "application/json")
                .json(&api_request)
        })
        .await?;

        let api_response: OpenAIResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api(provider.to_string(), format!("Failed to parse response: {}", e)))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm_api(provider.to_string(), "No choices in response"))?;

        let stop_reason = choice.finish_reason.as_deref().map(|r| match r {
            "length" => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        });

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: choice.message.content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: api_response.usage.prompt_tokens,
                output_tokens: api_response.usage.completion_tokens,
            },
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("test-key")
            .with_base_url("http://localhost:8080")
            .with_default_model("gpt-4o-mini")
            .with_timeout(5)
            .with_max_retries(0);

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_clients_report_provider() {
        let anthropic = AnthropicClient::new(ClientConfig::new("k")).unwrap();
        assert_eq!(anthropic.provider(), Provider::Anthropic);
        assert_eq!(anthropic.base_url(), "https://api.anthropic.com");

        let openai = OpenAIClient::new(ClientConfig::new("k").with_base_url("http://proxy")).unwrap();
        assert_eq!(openai.provider(), Provider::OpenAI);
        assert_eq!(openai.base_url(), "http://proxy");
    }

    #[test]
    fn test_api_error_parsing() {
        let err = api_error(
            Provider::OpenAI,
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "rate limited", "type": "rate_limit"}}"#,
        );
        assert!(err.to_string().contains("rate limited"));
        assert!(err.is_judge_failure());
    }
}
