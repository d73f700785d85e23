//! Shared types for inference.
//!
//! Canonical request/response types used by the dispatcher, plus the wire
//! types of the OpenAI-compatible Chat Completions API used for building
//! provider payloads and parsing provider responses.

use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::classifier::ErrorCategory;
use super::config::GenerationDefaults;
use crate::conversation::types::Message;

// ─── Roles ───────────────────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

// ─── Canonical Request ───────────────────────────────────────────────────────

/// Sampling and length controls for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&GenerationDefaults::default())
    }
}

impl From<&GenerationDefaults> for GenerationParams {
    fn from(d: &GenerationDefaults) -> Self {
        Self {
            max_tokens: d.max_tokens,
            temperature: d.temperature,
            top_p: d.top_p,
            frequency_penalty: d.frequency_penalty,
            presence_penalty: d.presence_penalty,
            stop: d.stop.clone(),
        }
    }
}

/// Editor context around the code being generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeContext {
    pub language: Option<String>,
    pub surrounding_code: Option<String>,
    pub file_path: Option<String>,
}

impl CodeContext {
    pub fn is_empty(&self) -> bool {
        self.language.is_none() && self.surrounding_code.is_none() && self.file_path.is_none()
    }
}

/// A generation request. Fields are private so a dispatched request cannot
/// be altered; build it with [`GenerationRequest::new`] and the `with_*`
/// methods.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    id: String,
    prompt: String,
    history: Vec<Message>,
    params: GenerationParams,
    code_context: Option<CodeContext>,
}

impl GenerationRequest {
    /// Create a request with a fresh unique ID.
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            history: Vec::new(),
            params,
            code_context: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_code_context(mut self, context: CodeContext) -> Self {
        self.code_context = (!context.is_empty()).then_some(context);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn code_context(&self) -> Option<&CodeContext> {
        self.code_context.as_ref()
    }

    /// Flatten history, code context, and prompt into provider messages.
    ///
    /// History comes first in order, then the prompt as the final user turn
    /// with the code context prepended.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .history
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        messages.push(ChatMessage {
            role: Role::User,
            content: self.prompt_with_context(),
        });
        messages
    }

    /// Render the full request as a single prompt for text-in/text-out models.
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        for msg in self.to_chat_messages() {
            out.push_str(msg.role.as_str());
            out.push_str(": ");
            out.push_str(&msg.content);
            out.push_str("\n\n");
        }
        out.push_str("assistant: ");
        out
    }

    fn prompt_with_context(&self) -> String {
        let Some(ctx) = &self.code_context else {
            return self.prompt.clone();
        };
        let Some(code) = ctx.surrounding_code.as_deref().filter(|c| !c.trim().is_empty()) else {
            return self.prompt.clone();
        };

        let mut out = String::new();
        if let Some(path) = &ctx.file_path {
            out.push_str(&format!("File: {path}\n"));
        }
        out.push_str("```");
        out.push_str(ctx.language.as_deref().unwrap_or(""));
        out.push('\n');
        out.push_str(code.trim_end());
        out.push_str("\n```\n\n");
        out.push_str(&self.prompt);
        out
    }
}

// ─── Canonical Response ──────────────────────────────────────────────────────

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Timeout,
    Error,
}

impl FinishReason {
    /// Map a provider finish reason onto the canonical set.
    ///
    /// A missing reason is treated as a normal stop; unrecognized values
    /// become `Error`.
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(_) => FinishReason::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FinishReason::Error | FinishReason::Timeout)
    }
}

/// Token accounting for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Where a response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Local,
    Remote,
}

/// Caller's routing preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePreference {
    Local,
    Remote,
    #[default]
    Auto,
}

impl FromStr for SourcePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(SourcePreference::Local),
            "remote" => Ok(SourcePreference::Remote),
            "auto" => Ok(SourcePreference::Auto),
            other => Err(format!("unknown source preference '{other}'")),
        }
    }
}

/// The terminal result of a dispatch. Exactly one per request.
///
/// Only constructible from a `&GenerationRequest`, so `request_id` always
/// refers to an issued request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub request_id: String,
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub latency_ms: u64,
    /// `None` only when no source could be selected (configuration error).
    pub source: Option<SourceType>,
    pub model: Option<String>,
}

impl InferenceResponse {
    pub(crate) fn completed(
        request: &GenerationRequest,
        source: SourceType,
        model: Option<String>,
        text: String,
        usage: TokenUsage,
        finish_reason: FinishReason,
        started: Instant,
    ) -> Self {
        Self {
            request_id: request.id().to_string(),
            text,
            usage,
            finish_reason,
            error: None,
            error_category: None,
            latency_ms: started.elapsed().as_millis() as u64,
            source: Some(source),
            model,
        }
    }

    pub(crate) fn failed(
        request: &GenerationRequest,
        source: Option<SourceType>,
        finish_reason: FinishReason,
        message: String,
        category: Option<ErrorCategory>,
        started: Instant,
    ) -> Self {
        Self {
            request_id: request.id().to_string(),
            text: String::new(),
            usage: TokenUsage::default(),
            finish_reason,
            error: Some(message),
            error_category: category,
            latency_ms: started.elapsed().as_millis() as u64,
            source,
            model: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.finish_reason.is_error()
    }

    /// Turn a completed response into an error response, keeping its ID,
    /// source, and latency.
    pub(crate) fn into_failure(mut self, message: String) -> Self {
        self.text.clear();
        self.finish_reason = FinishReason::Error;
        self.error = Some(message);
        self
    }
}

// ─── Wire Types (OpenAI-compatible) ─────────────────────────────────────────

/// A single message in a provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    pub stream: bool,
}

impl ChatCompletionRequest {
    /// Build the provider payload, mapping generation parameters 1:1.
    pub fn from_request(model: &str, request: &GenerationRequest) -> Self {
        let params = request.params();
        Self {
            model: model.to_string(),
            messages: request.to_chat_messages(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            stop: params.stop.clone(),
            stream: false,
        }
    }
}

/// Response body of a non-streaming chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<CompletionUsage>,
}

/// One choice in a completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: Option<CompletionMessage>,
    /// Legacy `/completions` responses carry plain `text`.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl CompletionChoice {
    pub fn content(&self) -> String {
        self.message
            .as_ref()
            .and_then(|m| m.content.clone())
            .or_else(|| self.text.clone())
            .unwrap_or_default()
    }
}

/// Assistant message in a completion choice.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// Provider-reported usage counts.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CompletionUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl From<CompletionUsage> for TokenUsage {
    fn from(u: CompletionUsage) -> Self {
        let total = if u.total_tokens > 0 {
            u.total_tokens
        } else {
            u.prompt_tokens.saturating_add(u.completion_tokens)
        };
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: total,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
