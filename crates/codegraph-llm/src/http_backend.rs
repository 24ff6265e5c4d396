//! HTTP messages backend.
//!
//! Speaks an Anthropic-style messages endpoint: one user message per
//! invocation, strict-JSON system prompt, API key header. Rate limits and
//! auth failures are mapped to their own error variants so the breaker
//! and worker layers can treat them differently from genuine failures.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::prompts;
use crate::types::{LlmBackend, LlmError, LlmInvocation, LlmResponse};

/// API version header value expected by the endpoint.
const API_VERSION: &str = "2023-06-01";

/// HTTP backend for an Anthropic-style messages API.
#[derive(Debug)]
pub struct HttpLlmBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    default_model: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<OutgoingMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl HttpLlmBackend {
    /// Construct a backend. Fails when no API key is available: an
    /// unauthenticated pipeline run is a configuration error, not
    /// something to discover after discovery has queued a thousand jobs.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
            LlmError::Misconfiguration(
                "LLM API key not set; provide LLM_API_KEY or run with --test-mode".to_string(),
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::Misconfiguration(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            default_model: default_model.into(),
        })
    }

    fn resolve_model<'a>(&'a self, invocation: &'a LlmInvocation) -> &'a str {
        if invocation.model.is_empty() {
            &self.default_model
        } else {
            &invocation.model
        }
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn invoke(&self, invocation: &LlmInvocation) -> Result<LlmResponse, LlmError> {
        let body = MessagesRequest {
            model: self.resolve_model(invocation),
            max_tokens: invocation.max_tokens,
            temperature: invocation.temperature,
            system: prompts::SYSTEM_PROMPT,
            messages: vec![OutgoingMessage {
                role: "user",
                content: prompts::render(&invocation.task),
            }],
        };

        let started = Instant::now();
        tracing::debug!(task = invocation.task.label(), model = body.model, "LLM request");

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(invocation.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(invocation.timeout)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::Auth(format!("endpoint returned {status}")));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                message: truncate(&message, 500),
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("response envelope: {e}")))?;
        let raw = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            raw,
            provider: "http".to_string(),
            model_used: if parsed.model.is_empty() {
                self.resolve_model(invocation).to_string()
            } else {
                parsed.model
            },
            duration: started.elapsed(),
        })
    }

    fn provider(&self) -> &str {
        "http"
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
