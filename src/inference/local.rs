//! Local model backend.
//!
//! The model itself is a black box behind [`LocalPredictor`]: prompt text in,
//! generated text out. [`LocalModel`] describes the weights file so the
//! dispatcher can decide whether local inference is possible and the
//! resource gate can estimate its footprint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Serialize;

use super::client::parse_completion_body;
use super::config::LocalConfig;
use super::errors::{from_transport_error, InferenceError};

/// Default deadline for the HTTP predictor when the config sets none.
const DEFAULT_PREDICT_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Model file ──────────────────────────────────────────────────────────────

/// A validated local model weights file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModel {
    pub path: PathBuf,
    pub size_mb: u64,
}

impl LocalModel {
    /// Validate that `path` names a readable, non-empty regular file.
    pub fn probe(path: &Path) -> Result<Self, InferenceError> {
        let meta = std::fs::metadata(path).map_err(|e| InferenceError::ConfigError {
            reason: format!("local model '{}' is not accessible: {e}", path.display()),
        })?;
        if !meta.is_file() {
            return Err(InferenceError::ConfigError {
                reason: format!("local model '{}' is not a file", path.display()),
            });
        }
        if meta.len() == 0 {
            return Err(InferenceError::ConfigError {
                reason: format!("local model '{}' is empty", path.display()),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            size_mb: meta.len().div_ceil(1024 * 1024),
        })
    }

    /// Short display name derived from the file name.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

// ─── Predictor seam ──────────────────────────────────────────────────────────

/// Opaque local model execution.
#[async_trait]
pub trait LocalPredictor: Send + Sync {
    async fn predict(&self, prompt: &str) -> Result<String, InferenceError>;
}

/// Predictor backed by a local OpenAI-compatible server (llama-server, Ollama).
pub struct EndpointPredictor {
    http: HttpClient,
    url: String,
    model_name: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct CompletionPayload<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

impl EndpointPredictor {
    pub fn from_config(config: &LocalConfig, model: &LocalModel) -> Result<Self, InferenceError> {
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PREDICT_TIMEOUT);
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build local HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            url: format!("{}/completions", config.endpoint.trim_end_matches('/')),
            model_name: config.model_name.clone().unwrap_or_else(|| model.name()),
            timeout,
        })
    }
}

#[async_trait]
impl LocalPredictor for EndpointPredictor {
    async fn predict(&self, prompt: &str) -> Result<String, InferenceError> {
        let payload = CompletionPayload {
            model: &self.model_name,
            prompt,
            stream: false,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| from_transport_error(&self.url, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::LocalModel {
                reason: format!("local server returned HTTP {}: {body}", status.as_u16()),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| from_transport_error(&self.url, self.timeout, e))?;
        let parsed = parse_completion_body(&body)?;
        Ok(parsed
            .choices
            .first()
            .map(|c| c.content())
            .unwrap_or_default())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
