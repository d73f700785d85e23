//! Remote provider client.
//!
//! Sends non-streaming chat completion requests to an OpenAI-compatible
//! endpoint with bearer-token authentication. One call is one attempt; the
//! dispatcher wraps it in the retry policy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client as HttpClient;

use super::config::RemoteConfig;
use super::errors::{from_transport_error, InferenceError};
use super::types::{ChatCompletionRequest, ChatCompletionResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Transport seam ──────────────────────────────────────────────────────────

/// One chat-completion round trip to a provider.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Model name sent in payloads.
    fn model(&self) -> &str;

    /// Perform a single request. Must not retry internally.
    async fn complete(
        &self,
        payload: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, InferenceError>;
}

// ─── RemoteClient ────────────────────────────────────────────────────────────

/// HTTP transport for the remote provider.
pub struct RemoteClient {
    http: HttpClient,
    url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl RemoteClient {
    /// Create a client from the remote configuration.
    ///
    /// Fails with a configuration error when credentials are missing.
    /// Connectivity is not checked until the first request.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, InferenceError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| InferenceError::ConfigError {
                reason: "remote.api_key is not set".into(),
            })?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            timeout,
        })
    }

    /// The full completions URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CompletionTransport for RemoteClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        payload: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, InferenceError> {
        tracing::debug!(
            url = %self.url,
            model = %payload.model,
            message_count = payload.messages.len(),
            max_tokens = payload.max_tokens,
            "remote completion request"
        );

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| from_transport_error(&self.url, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_from_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| from_transport_error(&self.url, self.timeout, e))?;
        parse_completion_body(&body)
    }
}

/// Parse a 2xx completion body.
pub(crate) fn parse_completion_body(body: &str) -> Result<ChatCompletionResponse, InferenceError> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseParse {
            reason: format!("invalid completion JSON: {e}"),
        })?;
    if parsed.choices.is_empty() {
        return Err(InferenceError::ResponseParse {
            reason: "completion response has no choices".into(),
        });
    }
    Ok(parsed)
}

// ─── Retry-After ─────────────────────────────────────────────────────────────

/// Read a server-specified retry delay from response headers.
///
/// `retry-after-ms` wins over `retry-after`; the latter may be seconds or an
/// HTTP date.
fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
    {
        return Some(Duration::from_secs_f64(ms / 1000.0));
    }
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Parse a `Retry-After` value: delta-seconds or an RFC 2822 date.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    at.with_timezone(&chrono::Utc)
        .signed_duration_since(chrono::Utc::now())
        .to_std()
        .ok()
        .or(Some(Duration::ZERO))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
