//! OpenAI-compatible chat completions client.
//!
//! Every failure is mapped onto [`CallError`] so the coordination layer can
//! classify it: HTTP statuses keep their code and any `Retry-After` hint,
//! transport failures become network errors with an errno-style code.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use review_coordination::{AnalysisClient, CallError, CompletionRequest, CompletionResponse};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 512;

/// Upper bound for a server `Retry-After` hint.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl ChatCompletionsClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, CallError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| CallError::Config("invalid API key format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| CallError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.2,
            timeout,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn map_transport(&self, e: reqwest::Error) -> CallError {
        if e.is_timeout() {
            CallError::Timeout(self.timeout)
        } else if e.is_connect() {
            CallError::network("ECONNREFUSED", e.to_string())
        } else if e.is_body() || e.is_decode() {
            CallError::network("ECONNRESET", e.to_string())
        } else {
            CallError::network("EREQUEST", e.to_string())
        }
    }
}

/// `Retry-After` in delay-seconds form, capped at [`MAX_RETRY_AFTER`].
/// HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| match Duration::try_from_secs_f64(secs) {
            Ok(hint) => Some(hint.min(MAX_RETRY_AFTER)),
            // Too large to represent; negative and NaN are dropped.
            Err(_) if secs > 0.0 => Some(MAX_RETRY_AFTER),
            Err(_) => None,
        })
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
    error: Option<ApiError>,
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
struct ApiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[async_trait]
impl AnalysisClient for ChatCompletionsClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, CallError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_context,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            max_tokens: request.max_output_units,
            temperature: self.temperature,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.map_err(|e| self.map_transport(e))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ChatResponse>(&text)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| truncate(&text, MAX_ERROR_BODY).to_string());
            return Err(CallError::Http {
                status: status.as_u16(),
                message,
                retry_after,
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| CallError::Provider(format!("invalid JSON response: {e}")))?;
        if let Some(error) = parsed.error {
            return Err(CallError::Provider(
                error.message.unwrap_or_else(|| "unknown provider error".into()),
            ));
        }
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CallError::Provider("no choices in response".into()))?;

        debug!(
            task = %request.task,
            model = %self.model,
            latency_ms = started.elapsed().as_millis() as u64,
            chars = content.len(),
            "Completion received"
        );

        let response = CompletionResponse::new(content);
        Ok(match parsed.usage {
            Some(usage) => response.with_usage(
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
            ),
            None => response,
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}
