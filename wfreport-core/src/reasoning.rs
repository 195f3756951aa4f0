//! Reasoning stage: turns extracted facts into prose plus cited claims
//!
//! The backend only ever sees facts serialized with their provenance tokens
//! and confidence; every claim it returns must cite one of those tokens to
//! survive composition. Nothing here fabricates a fallback summary: a failed or
//! timed-out call is an error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::catalog::SchemaCatalog;
use crate::facts::{FactSet, Provenance};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn complete(&self, request: &ReasoningRequest) -> Result<ReasoningCompletion, ReasoningError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum ReasoningError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Unusable completion: {0}")]
    MalformedCompletion(String),

    #[error("Completion was truncated by the token limit")]
    Truncated,

    #[error("Reasoning timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl ReasoningError {
    fn is_retryable(&self) -> bool {
        matches!(self, ReasoningError::Api { code: 429, .. })
    }
}

// ============================================================================
// Request / completion
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningRequest {
    pub question: String,
    pub system_context: String,
    pub facts_context: String,
}

/// A statement the backend makes, citing the fact it rests on. Claims whose
/// citation cannot be parsed keep `provenance: None` and never ground.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(default, alias = "claim")]
    pub text: String,
    #[serde(default, alias = "source", deserialize_with = "lenient_provenance")]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

fn lenient_provenance<'de, D>(deserializer: D) -> Result<Option<Provenance>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningCompletion {
    #[serde(alias = "summary")]
    pub prose: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

impl ReasoningCompletion {
    /// Parse the backend's JSON answer, tolerating a fenced code block.
    pub fn parse(content: &str) -> Result<Self, ReasoningError> {
        let trimmed = content.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|s| s.strip_suffix("```"))
            .unwrap_or(trimmed);

        let completion: ReasoningCompletion =
            serde_json::from_str(body).map_err(|e| ReasoningError::MalformedCompletion(e.to_string()))?;
        if completion.prose.trim().is_empty() {
            return Err(ReasoningError::MalformedCompletion("empty prose".to_string()));
        }
        Ok(completion)
    }
}

const SYSTEM_INSTRUCTION: &str = "\
You are a workflow-status report writer. You receive a user question about \
workflow packages, instances, work items and participants, plus a list of \
facts extracted from the workflow database. Each fact has a provenance token \
of the form table.column#record_id and a confidence tag (High, Medium, Low).

Write an executive summary that answers the question using only these facts. \
Mention uncertainty for Medium and Low facts. Do not invent records, values, \
dates or people that are not in the facts.

Respond with a single JSON object:
{\"prose\": \"<executive summary, markdown allowed>\", \
\"claims\": [{\"text\": \"<one sentence>\", \"provenance\": \"<token>\", \"value\": <fact value>}]}
Every claim must cite exactly one provenance token copied from the facts.";

/// Assemble the backend request for `question` over `facts`.
pub fn build_request(question: &str, facts: &FactSet, catalog: &SchemaCatalog) -> ReasoningRequest {
    let system_context = format!(
        "{SYSTEM_INSTRUCTION}\n\nSchema:\n{}",
        catalog.prompt_summary()
    );

    let entries: Vec<serde_json::Value> = facts
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id,
                "provenance": f.provenance.to_string(),
                "about": f.subject,
                "value": f.value,
                "confidence": f.confidence,
                "supporting_records": f.supporting_records(),
            })
        })
        .collect();
    let facts_context = serde_json::Value::Array(entries).to_string();

    ReasoningRequest {
        question: question.to_string(),
        system_context,
        facts_context,
    }
}

/// Run the backend under `timeout`. Elapsed time maps to [`ReasoningError::Timeout`].
pub async fn summarize(
    backend: &dyn ReasoningBackend,
    request: &ReasoningRequest,
    timeout: Duration,
) -> Result<ReasoningCompletion, ReasoningError> {
    match tokio::time::timeout(timeout, backend.complete(request)).await {
        Ok(Ok(completion)) => {
            tracing::info!(
                backend = backend.name(),
                claims = completion.claims.len(),
                "Reasoning completed"
            );
            Ok(completion)
        }
        Ok(Err(e)) => {
            tracing::error!(backend = backend.name(), error = %e, "Reasoning failed");
            Err(e)
        }
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            tracing::warn!(backend = backend.name(), timeout_ms, "Reasoning timed out");
            Err(ReasoningError::Timeout { timeout_ms })
        }
    }
}

// ============================================================================
// OpenAI chat completions client
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReasoningClientConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl ReasoningClientConfig {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model,
            max_tokens: 1200,
            temperature: 0.0,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiReasoningClient {
    client: Client,
    config: ReasoningClientConfig,
    base_url: String,
}

impl OpenAiReasoningClient {
    pub fn new(config: ReasoningClientConfig) -> Result<Self, ReasoningError> {
        Self::with_base_url(config, DEFAULT_BASE_URL.to_string())
    }

    /// Create a client against a custom base URL (gateways, tests).
    pub fn with_base_url(config: ReasoningClientConfig, base_url: String) -> Result<Self, ReasoningError> {
        if config.api_key.is_empty() {
            return Err(ReasoningError::MissingApiKey);
        }

        // The stage timeout bounds the whole call; this only stops a hung socket.
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;

        Ok(Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn complete_once(&self, request: &ReasoningRequest) -> Result<ReasoningCompletion, ReasoningError> {
        let url = format!("{}/chat/completions", self.base_url);
        let user_content = format!(
            "Question: {}\n\nFacts (JSON):\n{}",
            request.question, request.facts_context
        );
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_context,
                },
                ChatMessage {
                    role: "user",
                    content: &user_content,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);
            tracing::error!(code = status.as_u16(), message = %message, "Reasoning API error");
            return Err(ReasoningError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let chat: ChatResponse = response.json().await?;
        let choice = chat
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ReasoningError::MalformedCompletion("no choices".to_string()))?;
        if choice.finish_reason.as_deref() == Some("length") {
            return Err(ReasoningError::Truncated);
        }
        let content = choice
            .message
            .content
            .ok_or_else(|| ReasoningError::MalformedCompletion("empty message".to_string()))?;

        ReasoningCompletion::parse(&content)
    }
}

#[async_trait]
impl ReasoningBackend for OpenAiReasoningClient {
    async fn complete(&self, request: &ReasoningRequest) -> Result<ReasoningCompletion, ReasoningError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::spawn(
            retry_strategy,
            || self.complete_once(request),
            |e: &ReasoningError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::warn!(error = %e, "Reasoning API rate limited, backing off");
                }
                retry
            },
        )
        .await
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// TESTS
// ============================================================================
