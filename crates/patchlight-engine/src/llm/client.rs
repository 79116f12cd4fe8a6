//! Chat-completion client for the analysis backend.
//!
//! The engine consumes completions through [`CompletionBackend`] so tests and
//! degraded deployments can inject fakes; availability is an explicit
//! capability check, not a runtime type probe. The HTTP implementation talks
//! to an OpenAI-compatible endpoint and retries once against the configured
//! fallback model before giving up.

use patchlight_adapters::config::Config;
use patchlight_adapters::store::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const ANALYSIS_TEMPERATURE: f32 = 0.2;

/// One chat message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Capability-checked completion service.
///
/// `complete` may fail for transient reasons (timeout, rate limit); callers
/// treat any failure as local to the unit of work that issued it.
pub trait CompletionBackend: Send + Sync {
    fn complete<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        schema: Option<&'a serde_json::Value>,
    ) -> BoxFuture<'a, anyhow::Result<String>>;

    /// Whether the backend is configured at all. When false, callers skip
    /// completion calls and use their non-LLM fallbacks.
    fn is_available(&self) -> bool;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaWrapper<'a>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper<'a> {
    name: &'static str,
    strict: bool,
    schema: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageBody,
}

#[derive(Deserialize)]
struct MessageBody {
    /// Null when the response was blocked or errored out upstream.
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// reqwest-backed client for an OpenAI-compatible chat-completions API.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    fallback_model: String,
    max_tokens: u32,
}

impl HttpCompletionClient {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.default_model.clone(),
            fallback_model: config.fallback_model.clone(),
            max_tokens: config.max_completion_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        schema: Option<&serde_json::Value>,
    ) -> anyhow::Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("completion backend not configured"))?;

        let request = ChatRequest {
            model,
            messages,
            temperature: ANALYSIS_TEMPERATURE,
            max_tokens: self.max_tokens,
            response_format: schema.map(|schema| ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaWrapper {
                    name: "file_analysis",
                    strict: false,
                    schema,
                },
            }),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "completion request failed with status {}: {}",
                status,
                truncate_error(&body)
            ));
        }

        let parsed: ChatResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("completion response contained no choices"))?;

        match choice.message.content {
            Some(content) => Ok(content),
            None => Err(anyhow::anyhow!(
                "completion response had no content{}",
                choice
                    .message
                    .refusal
                    .map(|r| format!(" (refusal: {})", truncate_error(&r)))
                    .unwrap_or_default()
            )),
        }
    }
}

impl CompletionBackend for HttpCompletionClient {
    fn complete<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        schema: Option<&'a serde_json::Value>,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            match self.request_once(&self.model, messages, schema).await {
                Ok(content) => Ok(content),
                Err(err) => {
                    if self.fallback_model == self.model || self.api_key.is_none() {
                        return Err(err);
                    }
                    warn!(
                        "model {} failed ({}), retrying with fallback {}",
                        self.model, err, self.fallback_model
                    );
                    let content = self
                        .request_once(&self.fallback_model, messages, schema)
                        .await?;
                    debug!("fallback model {} succeeded", self.fallback_model);
                    Ok(content)
                }
            }
        })
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

fn truncate_error(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let head: String = body.chars().take(MAX).collect();
        format!("{}...", head)
    }
}
